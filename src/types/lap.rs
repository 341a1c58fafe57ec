//! Lap boundaries, lap views, and data-quality anomalies.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::SessionId;

/// Marks the sample at which a new lap began.
///
/// Derived by the recorder from `lap_number` transitions, never taken as
/// independent input. Persisted in the session's event index so lap
/// extraction does not need a full sample scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapBoundary {
    /// Sequence of the first sample of the new lap.
    pub sequence: u64,
    pub lap_number: u16,
    /// Arrival wall-clock time of that sample, unix microseconds.
    pub wall_clock_us: i64,
}

/// Kinds of data-quality anomalies the recorder flags without aborting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// Source-reported lap number went backward. Could be a pit restart or a
    /// source reset; recording continues either way.
    LapRegression { from: u16, to: u16 },
    /// Logical timestamp jumped forward by more than can be explained by the
    /// stream's cadence or a single counter wrap.
    TimestampJump { delta_us: u64 },
    /// Distance channel reversed within a lap beyond tolerance.
    DistanceReversal { from_m: f32, to_m: f32 },
}

/// A structured data-quality warning attached to a session.
///
/// Surfaced to consumers so a UI can badge the affected session or lap
/// rather than silently mis-aligning comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    /// Sequence of the sample that triggered the flag.
    pub sequence: u64,
    pub kind: AnomalyKind,
}

/// One entry in a session's event index file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    Boundary(LapBoundary),
    Anomaly(Anomaly),
}

/// Canonical duration of a lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LapTime {
    /// Taken from `last_lap_time_ms` on the first sample of the following
    /// lap (the source reports completed-lap time one lap late).
    Reported(u32),
    /// No following lap existed; computed from the timestamp span of the
    /// lap's own samples. Best effort.
    Estimated(u32),
}

impl LapTime {
    pub fn ms(self) -> u32 {
        match self {
            LapTime::Reported(ms) | LapTime::Estimated(ms) => ms,
        }
    }

    pub fn is_estimated(self) -> bool {
        matches!(self, LapTime::Estimated(_))
    }
}

/// A contiguous slice of one session covering a single lap.
///
/// A view constructed on demand by the lap extractor, never stored or
/// mutated. Invalidated if the underlying session is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    pub session: SessionId,
    pub lap_number: u16,
    /// Sequence range `[start, end)` of the lap's samples.
    pub sequences: Range<u64>,
    pub time: LapTime,
    /// False for the trailing lap of a session that ended mid-lap. Partial
    /// laps may be displayed but are rejected for best-lap selection.
    pub complete: bool,
}

impl Lap {
    /// Number of samples in the lap.
    pub fn len(&self) -> u64 {
        self.sequences.end - self.sequences.start
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}
