//! Session identity and metadata.

use serde::{Deserialize, Serialize};

/// Opaque handle for one recorded session.
///
/// Allocated by the store from the session's start wall-clock time; threaded
/// explicitly through every call so multiple sessions can coexist (one
/// finishing while a new one starts) without shared mutable globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Car and track identity carried in the sled block of every datagram.
///
/// Decoded separately from the per-sample channels: it is fixed for the life
/// of a session, so the pipeline reads it once from the first datagram and
/// records it in the session metadata instead of in every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdent {
    pub car_ordinal: i32,
    pub car_class: i32,
    pub car_performance_index: i32,
    /// Only present in the longer car-dash layout.
    pub track_ordinal: Option<i32>,
}

/// Metadata fixed at session creation, stored in the session file header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Session start wall-clock time in unix microseconds (first sample's
    /// arrival time).
    pub start_wall_clock_us: i64,
    /// Human-readable source identifier, e.g. the peer or bind address.
    pub source: String,
    pub ident: SourceIdent,
}

/// Lifecycle state of a session in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Open for appends.
    Active,
    /// A write failed; the session is read-only but its flushed prefix
    /// remains fully readable.
    Degraded,
    /// Closed cleanly; all appended samples are durable.
    Closed,
}
