//! Public data model for the telemetry engine.

mod lap;
mod sample;
mod session;

pub use lap::{Anomaly, AnomalyKind, Lap, LapBoundary, LapTime, SessionEvent};
pub use sample::{Position, SamplePacket, TelemetrySample};
pub use session::{SessionId, SessionMeta, SessionState, SourceIdent};
