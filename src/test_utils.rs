//! Shared builders for synthetic datagrams and samples.
//!
//! Used by unit tests and benches; real captures are not required to
//! exercise the decoder or the recording path because the wire layouts are
//! small enough to synthesize exactly.

#![cfg(any(test, feature = "benchmark"))]

use crate::protocol::PacketLayout;
use crate::types::{Position, TelemetrySample};

/// Field values for a synthetic datagram. Everything not set by a test
/// defaults to a plausible mid-race value.
#[derive(Debug, Clone, Copy)]
pub struct PacketSpec {
    pub timestamp_us: u32,
    pub race_on: bool,
    pub position: (f32, f32, f32),
    pub distance: f32,
    pub speed: f32,
    pub rpm: f32,
    pub gear: u8,
    pub throttle: u8,
    pub brake: u8,
    pub steering: i8,
    pub lap_number: u16,
    pub current_lap_s: f32,
    pub last_lap_s: f32,
    pub best_lap_s: f32,
    pub car_ordinal: i32,
    pub car_class: i32,
    pub car_performance_index: i32,
    pub track_ordinal: Option<i32>,
}

impl Default for PacketSpec {
    fn default() -> Self {
        Self {
            timestamp_us: 1_000_000,
            race_on: true,
            position: (0.0, 0.0, 0.0),
            distance: 0.0,
            speed: 40.0,
            rpm: 5500.0,
            gear: 3,
            throttle: 128,
            brake: 0,
            steering: 0,
            lap_number: 1,
            current_lap_s: 10.0,
            last_lap_s: 0.0,
            best_lap_s: 0.0,
            car_ordinal: 1234,
            car_class: 5,
            car_performance_index: 700,
            track_ordinal: Some(860),
        }
    }
}

/// Encode a synthetic datagram of the given layout.
///
/// The exact inverse of the decoder for the fields the crate reads; all
/// other bytes are zero.
pub fn build_packet(layout: PacketLayout, spec: &PacketSpec) -> Vec<u8> {
    let mut raw = vec![0u8; layout.len()];

    // Sled block.
    put_i32(&mut raw, 0, if spec.race_on { 1 } else { 0 });
    put_u32(&mut raw, 4, spec.timestamp_us);
    put_f32(&mut raw, 16, spec.rpm);
    put_i32(&mut raw, 212, spec.car_ordinal);
    put_i32(&mut raw, 216, spec.car_class);
    put_i32(&mut raw, 220, spec.car_performance_index);

    // Dash block.
    let dash = layout.dash_offset();
    put_f32(&mut raw, dash, spec.position.0);
    put_f32(&mut raw, dash + 4, spec.position.1);
    put_f32(&mut raw, dash + 8, spec.position.2);
    put_f32(&mut raw, dash + 12, spec.speed);
    put_f32(&mut raw, dash + 48, spec.distance);
    put_f32(&mut raw, dash + 52, spec.best_lap_s);
    put_f32(&mut raw, dash + 56, spec.last_lap_s);
    put_f32(&mut raw, dash + 60, spec.current_lap_s);
    raw[dash + 68..dash + 70].copy_from_slice(&spec.lap_number.to_le_bytes());
    raw[dash + 71] = spec.throttle;
    raw[dash + 72] = spec.brake;
    raw[dash + 75] = spec.gear;
    raw[dash + 76] = spec.steering as u8;

    if let (Some(off), Some(ordinal)) = (layout.track_ordinal_offset(), spec.track_ordinal) {
        put_i32(&mut raw, off, ordinal);
    }

    raw
}

/// A decoded sample with the channels lap segmentation and alignment care
/// about, everything else zeroed.
pub fn sample(sequence: u64, lap_number: u16, distance: f32, speed: f32) -> TelemetrySample {
    TelemetrySample {
        sequence,
        timestamp_us: (sequence as u32).wrapping_mul(16_667),
        wall_clock_us: 1_700_000_000_000_000 + sequence as i64 * 16_667,
        race_on: true,
        position: Position { x: distance, y: 0.0, z: 0.0 },
        distance_traveled: distance,
        speed,
        rpm: 5000.0,
        gear: 3,
        throttle: 180,
        brake: 0,
        steering: 0,
        lap_number,
        current_lap_time_ms: sequence as u32 * 17,
        last_lap_time_ms: 0,
        best_lap_time_ms: 0,
    }
}

fn put_f32(raw: &mut [u8], off: usize, value: f32) {
    raw[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_i32(raw: &mut [u8], off: usize, value: i32) {
    raw[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(raw: &mut [u8], off: usize, value: u32) {
    raw[off..off + 4].copy_from_slice(&value.to_le_bytes());
}
