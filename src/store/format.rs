//! Binary codec for session files.
//!
//! A session is two append-only files:
//!
//! - `<id>.samples`: header followed by fixed-size sample records in
//!   sequence order.
//! - `<id>.laps`: tiny header followed by variable-size tagged event
//!   records (lap boundaries and anomalies), so lap extraction avoids a
//!   full sample scan.
//!
//! Everything is explicit little-endian. The codec is pure byte
//! manipulation; file I/O and path context live in the store.

use crate::error::{Result, TelemetryError};
use crate::types::{
    Anomaly, AnomalyKind, LapBoundary, Position, SessionEvent, SessionMeta, SourceIdent,
    TelemetrySample,
};

/// Magic prefix of a samples file.
pub const SAMPLES_MAGIC: [u8; 4] = *b"STNT";
/// Magic prefix of an events file.
pub const EVENTS_MAGIC: [u8; 4] = *b"STNX";
/// On-disk format version, bumped on any layout change.
pub const FORMAT_VERSION: u16 = 1;

/// Size of one encoded sample record.
pub const RECORD_SIZE: usize = 64;
/// Fixed portion of the samples-file header; the source identifier string
/// follows it.
pub const HEADER_FIXED_LEN: usize = 34;
/// Full events-file header.
pub const EVENTS_HEADER_LEN: usize = 6;

// Sentinel for "no track ordinal in the stream".
const NO_TRACK_ORDINAL: i32 = i32::MIN;

const EVENT_TAG_BOUNDARY: u8 = 1;
const EVENT_TAG_ANOMALY: u8 = 2;

const ANOMALY_TAG_LAP_REGRESSION: u8 = 1;
const ANOMALY_TAG_TIMESTAMP_JUMP: u8 = 2;
const ANOMALY_TAG_DISTANCE_REVERSAL: u8 = 3;

/// Encode the samples-file header.
pub fn encode_header(meta: &SessionMeta) -> Vec<u8> {
    let source = meta.source.as_bytes();
    // Source identifier is an address string; u16 length is ample.
    let source_len = source.len().min(u16::MAX as usize);

    let mut buf = Vec::with_capacity(HEADER_FIXED_LEN + source_len);
    buf.extend_from_slice(&SAMPLES_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(RECORD_SIZE as u16).to_le_bytes());
    buf.extend_from_slice(&meta.start_wall_clock_us.to_le_bytes());
    buf.extend_from_slice(&meta.ident.car_ordinal.to_le_bytes());
    buf.extend_from_slice(&meta.ident.car_class.to_le_bytes());
    buf.extend_from_slice(&meta.ident.car_performance_index.to_le_bytes());
    buf.extend_from_slice(&meta.ident.track_ordinal.unwrap_or(NO_TRACK_ORDINAL).to_le_bytes());
    buf.extend_from_slice(&(source_len as u16).to_le_bytes());
    buf.extend_from_slice(&source[..source_len]);
    buf
}

/// Validate the fixed header prefix and return the total header length.
pub fn header_total_len(fixed: &[u8]) -> Result<usize> {
    if fixed.len() < HEADER_FIXED_LEN {
        return Err(TelemetryError::corrupt(
            "samples header",
            format!("file too short for header: {} bytes", fixed.len()),
        ));
    }
    if fixed[0..4] != SAMPLES_MAGIC {
        return Err(TelemetryError::corrupt("samples header", "bad magic"));
    }
    let version = u16_at(fixed, 4);
    if version != FORMAT_VERSION {
        return Err(TelemetryError::FormatVersion { expected: FORMAT_VERSION, found: version });
    }
    let record_size = u16_at(fixed, 6) as usize;
    if record_size != RECORD_SIZE {
        return Err(TelemetryError::corrupt(
            "samples header",
            format!("record size {record_size}, expected {RECORD_SIZE}"),
        ));
    }
    Ok(HEADER_FIXED_LEN + u16_at(fixed, 32) as usize)
}

/// Decode a complete samples-file header.
pub fn decode_header(buf: &[u8]) -> Result<SessionMeta> {
    let total = header_total_len(buf)?;
    if buf.len() < total {
        return Err(TelemetryError::corrupt(
            "samples header",
            format!("header truncated: {} of {total} bytes", buf.len()),
        ));
    }

    let track = i32_at(buf, 28);
    Ok(SessionMeta {
        start_wall_clock_us: i64_at(buf, 8),
        source: String::from_utf8_lossy(&buf[HEADER_FIXED_LEN..total]).into_owned(),
        ident: SourceIdent {
            car_ordinal: i32_at(buf, 16),
            car_class: i32_at(buf, 20),
            car_performance_index: i32_at(buf, 24),
            track_ordinal: (track != NO_TRACK_ORDINAL).then_some(track),
        },
    })
}

/// Encode one sample into a fixed-size record.
pub fn encode_record(sample: &TelemetrySample) -> [u8; RECORD_SIZE] {
    let mut rec = [0u8; RECORD_SIZE];
    rec[0..8].copy_from_slice(&sample.sequence.to_le_bytes());
    rec[8..12].copy_from_slice(&sample.timestamp_us.to_le_bytes());
    rec[12..14].copy_from_slice(&sample.lap_number.to_le_bytes());
    rec[14] = sample.gear;
    rec[15] = u8::from(sample.race_on);
    rec[16..24].copy_from_slice(&sample.wall_clock_us.to_le_bytes());
    rec[24..28].copy_from_slice(&sample.position.x.to_le_bytes());
    rec[28..32].copy_from_slice(&sample.position.y.to_le_bytes());
    rec[32..36].copy_from_slice(&sample.position.z.to_le_bytes());
    rec[36..40].copy_from_slice(&sample.distance_traveled.to_le_bytes());
    rec[40..44].copy_from_slice(&sample.speed.to_le_bytes());
    rec[44..48].copy_from_slice(&sample.rpm.to_le_bytes());
    rec[48..52].copy_from_slice(&sample.current_lap_time_ms.to_le_bytes());
    rec[52..56].copy_from_slice(&sample.last_lap_time_ms.to_le_bytes());
    rec[56..60].copy_from_slice(&sample.best_lap_time_ms.to_le_bytes());
    rec[60] = sample.throttle;
    rec[61] = sample.brake;
    rec[62] = sample.steering as u8;
    rec
}

/// Decode one fixed-size record.
pub fn decode_record(rec: &[u8; RECORD_SIZE]) -> TelemetrySample {
    TelemetrySample {
        sequence: u64_at(rec, 0),
        timestamp_us: u32_at(rec, 8),
        lap_number: u16_at(rec, 12),
        gear: rec[14],
        race_on: rec[15] != 0,
        wall_clock_us: i64_at(rec, 16),
        position: Position { x: f32_at(rec, 24), y: f32_at(rec, 28), z: f32_at(rec, 32) },
        distance_traveled: f32_at(rec, 36),
        speed: f32_at(rec, 40),
        rpm: f32_at(rec, 44),
        current_lap_time_ms: u32_at(rec, 48),
        last_lap_time_ms: u32_at(rec, 52),
        best_lap_time_ms: u32_at(rec, 56),
        throttle: rec[60],
        brake: rec[61],
        steering: rec[62] as i8,
    }
}

/// Events-file header bytes.
pub fn events_header() -> [u8; EVENTS_HEADER_LEN] {
    let mut buf = [0u8; EVENTS_HEADER_LEN];
    buf[0..4].copy_from_slice(&EVENTS_MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

/// Encode one tagged event record.
pub fn encode_event(event: &SessionEvent) -> Vec<u8> {
    match event {
        SessionEvent::Boundary(b) => {
            let mut buf = Vec::with_capacity(19);
            buf.push(EVENT_TAG_BOUNDARY);
            buf.extend_from_slice(&b.sequence.to_le_bytes());
            buf.extend_from_slice(&b.lap_number.to_le_bytes());
            buf.extend_from_slice(&b.wall_clock_us.to_le_bytes());
            buf
        }
        SessionEvent::Anomaly(a) => {
            let (kind, x, y) = match a.kind {
                AnomalyKind::LapRegression { from, to } => {
                    (ANOMALY_TAG_LAP_REGRESSION, i64::from(from), i64::from(to))
                }
                AnomalyKind::TimestampJump { delta_us } => {
                    (ANOMALY_TAG_TIMESTAMP_JUMP, delta_us as i64, 0)
                }
                AnomalyKind::DistanceReversal { from_m, to_m } => (
                    ANOMALY_TAG_DISTANCE_REVERSAL,
                    i64::from(from_m.to_bits()),
                    i64::from(to_m.to_bits()),
                ),
            };
            let mut buf = Vec::with_capacity(26);
            buf.push(EVENT_TAG_ANOMALY);
            buf.extend_from_slice(&a.sequence.to_le_bytes());
            buf.push(kind);
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
            buf
        }
    }
}

/// Decode a whole events file.
///
/// A trailing partial record (torn write from an unclean shutdown) is
/// tolerated and dropped; everything before it is returned.
pub fn decode_events(buf: &[u8]) -> Result<Vec<SessionEvent>> {
    if buf.len() < EVENTS_HEADER_LEN {
        return Err(TelemetryError::corrupt(
            "events header",
            format!("file too short for header: {} bytes", buf.len()),
        ));
    }
    if buf[0..4] != EVENTS_MAGIC {
        return Err(TelemetryError::corrupt("events header", "bad magic"));
    }
    let version = u16_at(buf, 4);
    if version != FORMAT_VERSION {
        return Err(TelemetryError::FormatVersion { expected: FORMAT_VERSION, found: version });
    }

    let mut events = Vec::new();
    let mut pos = EVENTS_HEADER_LEN;
    while pos < buf.len() {
        match buf[pos] {
            EVENT_TAG_BOUNDARY => {
                if pos + 19 > buf.len() {
                    break;
                }
                events.push(SessionEvent::Boundary(LapBoundary {
                    sequence: u64_at(buf, pos + 1),
                    lap_number: u16_at(buf, pos + 9),
                    wall_clock_us: i64_at(buf, pos + 11),
                }));
                pos += 19;
            }
            EVENT_TAG_ANOMALY => {
                if pos + 26 > buf.len() {
                    break;
                }
                let sequence = u64_at(buf, pos + 1);
                let x = i64_at(buf, pos + 10);
                let y = i64_at(buf, pos + 18);
                let kind = match buf[pos + 9] {
                    ANOMALY_TAG_LAP_REGRESSION => {
                        AnomalyKind::LapRegression { from: x as u16, to: y as u16 }
                    }
                    ANOMALY_TAG_TIMESTAMP_JUMP => AnomalyKind::TimestampJump { delta_us: x as u64 },
                    ANOMALY_TAG_DISTANCE_REVERSAL => AnomalyKind::DistanceReversal {
                        from_m: f32::from_bits(x as u32),
                        to_m: f32::from_bits(y as u32),
                    },
                    other => {
                        return Err(TelemetryError::corrupt(
                            "events file",
                            format!("unknown anomaly tag {other} at offset {pos}"),
                        ));
                    }
                };
                events.push(SessionEvent::Anomaly(Anomaly { sequence, kind }));
                pos += 26;
            }
            other => {
                return Err(TelemetryError::corrupt(
                    "events file",
                    format!("unknown event tag {other} at offset {pos}"),
                ));
            }
        }
    }
    Ok(events)
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn i32_at(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn i64_at(buf: &[u8], off: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(bytes)
}

fn f32_at(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
