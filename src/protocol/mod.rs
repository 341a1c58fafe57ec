//! Packet decoder for the simulator's UDP "data out" protocol.
//!
//! [`decode`] turns one raw datagram into a [`TelemetrySample`]. It is a
//! pure function: no I/O, no shared state, identical bytes always yield an
//! identical sample or error, and it is safe to call concurrently on
//! independent buffers. Layout dispatch is table-driven on datagram length
//! (see [`PacketLayout`]); all numeric fields are read with explicit
//! little-endian fixed-width decoding.
//!
//! The raw `timestamp_us` counter wraps and is passed through uncorrected;
//! wraparound reconstruction is the recorder's job since only the recorder
//! has session-scoped history.

mod layout;

pub use layout::PacketLayout;

use crate::error::DecodeError;
use crate::types::{Position, SourceIdent, TelemetrySample};

use layout::*;

/// Decode one raw datagram into a telemetry sample.
///
/// `sequence` and `wall_clock_us` on the returned sample are zero; the
/// recorder assigns both on arrival.
///
/// # Errors
///
/// [`DecodeError::TruncatedBuffer`] when the datagram is shorter than the
/// smallest known layout, [`DecodeError::UnknownLayout`] when its length
/// matches no known layout.
pub fn decode(raw: &[u8]) -> Result<TelemetrySample, DecodeError> {
    let layout = layout_for(raw.len())?;
    let dash = layout.dash_offset();

    let best_lap_s = f32_at(raw, dash + DASH_BEST_LAP);
    let last_lap_s = f32_at(raw, dash + DASH_LAST_LAP);
    let current_lap_s = f32_at(raw, dash + DASH_CURRENT_LAP);

    Ok(TelemetrySample {
        sequence: 0,
        timestamp_us: u32_at(raw, SLED_TIMESTAMP),
        wall_clock_us: 0,
        race_on: i32_at(raw, SLED_IS_RACE_ON) != 0,
        position: Position {
            x: f32_at(raw, dash + DASH_POS_X),
            y: f32_at(raw, dash + DASH_POS_Y),
            z: f32_at(raw, dash + DASH_POS_Z),
        },
        distance_traveled: f32_at(raw, dash + DASH_DISTANCE),
        speed: f32_at(raw, dash + DASH_SPEED),
        rpm: f32_at(raw, SLED_CURRENT_RPM),
        gear: raw[dash + DASH_GEAR],
        throttle: raw[dash + DASH_ACCEL],
        brake: raw[dash + DASH_BRAKE],
        steering: raw[dash + DASH_STEER] as i8,
        lap_number: u16_at(raw, dash + DASH_LAP_NUMBER),
        current_lap_time_ms: seconds_to_ms(current_lap_s),
        last_lap_time_ms: seconds_to_ms(last_lap_s),
        best_lap_time_ms: seconds_to_ms(best_lap_s),
    })
}

/// Decode the car/track identity carried in a datagram.
///
/// Identity is fixed for the life of a session, so the pipeline calls this
/// once on the first decoded datagram to populate session metadata rather
/// than carrying the fields in every sample.
pub fn decode_ident(raw: &[u8]) -> Result<SourceIdent, DecodeError> {
    let layout = layout_for(raw.len())?;
    Ok(SourceIdent {
        car_ordinal: i32_at(raw, SLED_CAR_ORDINAL),
        car_class: i32_at(raw, SLED_CAR_CLASS),
        car_performance_index: i32_at(raw, SLED_CAR_PI),
        track_ordinal: layout.track_ordinal_offset().map(|off| i32_at(raw, off)),
    })
}

fn layout_for(len: usize) -> Result<PacketLayout, DecodeError> {
    if len < PacketLayout::MIN_LEN {
        return Err(DecodeError::TruncatedBuffer { len, min: PacketLayout::MIN_LEN });
    }
    PacketLayout::for_len(len).ok_or(DecodeError::UnknownLayout { len })
}

/// Lap times arrive as f32 seconds; stored as integer milliseconds.
fn seconds_to_ms(seconds: f32) -> u32 {
    if seconds.is_finite() && seconds > 0.0 {
        (f64::from(seconds) * 1000.0).round() as u32
    } else {
        0
    }
}

// Field readers index directly: the layout table has already validated the
// datagram length, so every offset below is in bounds.

fn f32_at(raw: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn i32_at(raw: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn u32_at(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn u16_at(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{PacketSpec, build_packet};
    use proptest::prelude::*;

    #[test]
    fn decodes_dash_layout_fields() {
        let spec = PacketSpec {
            timestamp_us: 123_456,
            race_on: true,
            position: (10.0, 1.5, -40.0),
            distance: 812.5,
            speed: 54.2,
            rpm: 6900.0,
            gear: 4,
            throttle: 200,
            brake: 0,
            steering: -30,
            lap_number: 3,
            current_lap_s: 41.207,
            last_lap_s: 92.5,
            best_lap_s: 90.0,
            car_ordinal: 2352,
            car_class: 6,
            car_performance_index: 842,
            track_ordinal: None,
        };
        let raw = build_packet(PacketLayout::Dash, &spec);
        assert_eq!(raw.len(), 311);

        let sample = decode(&raw).unwrap();
        assert_eq!(sample.timestamp_us, 123_456);
        assert!(sample.race_on);
        assert_eq!(sample.position.x, 10.0);
        assert_eq!(sample.position.z, -40.0);
        assert_eq!(sample.distance_traveled, 812.5);
        assert_eq!(sample.speed, 54.2);
        assert_eq!(sample.rpm, 6900.0);
        assert_eq!(sample.gear, 4);
        assert_eq!(sample.throttle, 200);
        assert_eq!(sample.brake, 0);
        assert_eq!(sample.steering, -30);
        assert_eq!(sample.lap_number, 3);
        assert_eq!(sample.current_lap_time_ms, 41_207);
        assert_eq!(sample.last_lap_time_ms, 92_500);
        assert_eq!(sample.best_lap_time_ms, 90_000);
        // Recorder-owned fields stay unassigned.
        assert_eq!(sample.sequence, 0);
        assert_eq!(sample.wall_clock_us, 0);

        let ident = decode_ident(&raw).unwrap();
        assert_eq!(ident.car_ordinal, 2352);
        assert_eq!(ident.track_ordinal, None);
    }

    #[test]
    fn decodes_horizon_layout_with_shifted_dash_block() {
        let spec = PacketSpec { lap_number: 7, speed: 33.0, ..PacketSpec::default() };
        let raw = build_packet(PacketLayout::Horizon, &spec);
        assert_eq!(raw.len(), 324);

        let sample = decode(&raw).unwrap();
        assert_eq!(sample.lap_number, 7);
        assert_eq!(sample.speed, 33.0);
    }

    #[test]
    fn decodes_car_dash_track_ordinal() {
        let spec = PacketSpec { track_ordinal: Some(860), ..PacketSpec::default() };
        let raw = build_packet(PacketLayout::CarDash, &spec);
        assert_eq!(raw.len(), 331);

        let ident = decode_ident(&raw).unwrap();
        assert_eq!(ident.track_ordinal, Some(860));
    }

    #[test]
    fn short_buffers_are_truncated() {
        for len in [0usize, 1, 232, 310] {
            let raw = vec![0u8; len];
            assert_eq!(
                decode(&raw),
                Err(DecodeError::TruncatedBuffer { len, min: 311 }),
                "len {len}"
            );
        }
    }

    #[test]
    fn unmatched_lengths_are_unknown_layouts() {
        for len in [312usize, 323, 325, 330, 332, 1024] {
            let raw = vec![0u8; len];
            assert_eq!(decode(&raw), Err(DecodeError::UnknownLayout { len }), "len {len}");
        }
    }

    #[test]
    fn negative_or_nan_lap_times_clamp_to_zero() {
        let spec =
            PacketSpec { current_lap_s: -1.0, last_lap_s: f32::NAN, ..PacketSpec::default() };
        let raw = build_packet(PacketLayout::Dash, &spec);
        let sample = decode(&raw).unwrap();
        assert_eq!(sample.current_lap_time_ms, 0);
        assert_eq!(sample.last_lap_time_ms, 0);
    }

    proptest! {
        #[test]
        fn decode_is_a_pure_total_function(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
            // Same bytes in, same result out, on repeated calls.
            let first = decode(&bytes);
            let second = decode(&bytes);
            prop_assert_eq!(first, second);

            match bytes.len() {
                l if l < 311 => prop_assert!(
                    matches!(first, Err(DecodeError::TruncatedBuffer { .. })),
                    "expected TruncatedBuffer, got {:?}",
                    first
                ),
                311 | 324 | 331 => prop_assert!(first.is_ok()),
                _ => prop_assert!(
                    matches!(first, Err(DecodeError::UnknownLayout { .. })),
                    "expected UnknownLayout, got {:?}",
                    first
                ),
            }
        }

        #[test]
        fn decode_round_trips_builder_fields(
            timestamp in any::<u32>(),
            distance in 0.0f32..500_000.0,
            speed in 0.0f32..150.0,
            lap in any::<u16>(),
        ) {
            let spec = PacketSpec {
                timestamp_us: timestamp,
                distance,
                speed,
                lap_number: lap,
                ..PacketSpec::default()
            };
            for layout in [PacketLayout::Dash, PacketLayout::Horizon, PacketLayout::CarDash] {
                let sample = decode(&build_packet(layout, &spec)).unwrap();
                prop_assert_eq!(sample.timestamp_us, timestamp);
                prop_assert_eq!(sample.distance_traveled, distance);
                prop_assert_eq!(sample.speed, speed);
                prop_assert_eq!(sample.lap_number, lap);
            }
        }
    }
}
