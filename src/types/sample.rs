//! Decoded telemetry observations.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// World-space position reported by the simulator, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One decoded telemetry observation.
///
/// Produced by the packet decoder from a single datagram; `sequence` and
/// `wall_clock_us` are zero at decode time and assigned by the session
/// recorder on arrival. `sequence` is the canonical ordering key within a
/// session: strictly increasing, gap-free, independent of network send order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Recorder-assigned arrival index, starting at 0 per session.
    pub sequence: u64,
    /// Raw capture-side microsecond counter. Wraps at `u32::MAX`; the
    /// recorder reconstructs a monotonic logical timestamp from it.
    pub timestamp_us: u32,
    /// Arrival wall-clock time in unix microseconds, stamped by the
    /// recorder. This is the time base video playback synchronizes against.
    pub wall_clock_us: i64,
    /// False while the simulator is paused or in menus. Such samples are
    /// retained, not discarded.
    pub race_on: bool,
    pub position: Position,
    /// Cumulative track distance in meters as reported by the source.
    pub distance_traveled: f32,
    /// Speed in m/s.
    pub speed: f32,
    pub rpm: f32,
    pub gear: u8,
    /// Raw throttle channel, 0..=255.
    pub throttle: u8,
    /// Raw brake channel, 0..=255.
    pub brake: u8,
    /// Raw steering channel, -127..=127.
    pub steering: i8,
    /// Source-reported current lap index.
    pub lap_number: u16,
    pub current_lap_time_ms: u32,
    pub last_lap_time_ms: u32,
    pub best_lap_time_ms: u32,
}

impl TelemetrySample {
    /// Zeroed sample. Mostly useful as a test scaffold.
    pub fn zeroed() -> Self {
        Self {
            sequence: 0,
            timestamp_us: 0,
            wall_clock_us: 0,
            race_on: false,
            position: Position::default(),
            distance_traveled: 0.0,
            speed: 0.0,
            rpm: 0.0,
            gear: 0,
            throttle: 0,
            brake: 0,
            steering: 0,
            lap_number: 0,
            current_lap_time_ms: 0,
            last_lap_time_ms: 0,
            best_lap_time_ms: 0,
        }
    }
}

/// A decoded sample paired with its raw datagram payload.
///
/// This is the unit that flows through the ingestion queue. The raw bytes
/// travel alongside the sample (zero-copy via `Arc`) because duplicate
/// suppression in the recorder compares payloads bit-for-bit.
#[derive(Debug, Clone)]
pub struct SamplePacket {
    /// Raw datagram payload.
    pub raw: Arc<[u8]>,
    /// Decoded sample; `sequence`/`wall_clock_us` not yet assigned.
    pub sample: TelemetrySample,
    /// Arrival wall-clock time in unix microseconds, taken in the receive
    /// loop so queueing delay does not skew it.
    pub received_us: i64,
}

impl SamplePacket {
    pub fn new(raw: Vec<u8>, sample: TelemetrySample, received_us: i64) -> Self {
        Self { raw: raw.into(), sample, received_us }
    }
}
