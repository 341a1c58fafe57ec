//! Distance-based alignment of two laps for side-by-side comparison.
//!
//! Two laps of the same track never sample at the same distances: frame
//! rates differ, speeds differ. Resampling both laps onto a shared distance
//! grid makes them directly comparable at every grid point, which is what a
//! delta trace or a braking-point overlay needs.

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, Result};
use crate::extractor::lap_samples;
use crate::store::SessionStore;
use crate::types::{Lap, TelemetrySample};

/// Grid parameters for [`align`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignConfig {
    /// Spacing between grid points in metres.
    pub step_m: f64,
    /// Slack allowed before a distance decrease counts as non-monotonic.
    /// Small jitter from the source's own interpolation is normal.
    pub tolerance_m: f64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self { step_m: 10.0, tolerance_m: 0.5 }
    }
}

/// One lap's channels resampled at a single grid distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub speed_mps: f64,
    pub rpm: f64,
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    /// Elapsed lap time at this distance, from `current_lap_time_ms`.
    pub lap_time_ms: f64,
    pub position: [f64; 3],
    /// Gear is discrete; held from the nearest preceding sample rather
    /// than interpolated.
    pub gear: u8,
}

/// Both laps at a single grid distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignedPoint {
    pub distance_m: f64,
    pub a: ChannelPoint,
    pub b: ChannelPoint,
}

/// The full comparison: one [`AlignedPoint`] per grid distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedComparison {
    pub step_m: f64,
    pub points: Vec<AlignedPoint>,
}

impl AlignedComparison {
    /// Time delta of lap B relative to lap A at each grid point, in ms.
    /// Positive means B is behind.
    pub fn time_delta_ms(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.b.lap_time_ms - p.a.lap_time_ms).collect()
    }
}

/// Resample two laps onto a shared distance grid.
///
/// Distances are normalised so each lap starts at zero, which cancels the
/// source's cumulative odometer. The grid runs from zero to the shorter
/// lap's final distance inclusive; beyond that one lap has no data and
/// extrapolation would fabricate a comparison.
///
/// Deterministic: equal inputs produce equal outputs, and swapping the
/// laps swaps the `a`/`b` channels without changing the grid.
pub fn align(
    lap_a: &[TelemetrySample],
    lap_b: &[TelemetrySample],
    config: &AlignConfig,
) -> Result<AlignedComparison, AlignError> {
    let a = NormalizedLap::new(lap_a, config)?;
    let b = NormalizedLap::new(lap_b, config)?;

    let max_common = a.final_distance().min(b.final_distance());
    let mut points = Vec::new();
    let mut i = 0u64;
    loop {
        let distance = i as f64 * config.step_m;
        // Inclusive upper bound with slack for accumulated float error.
        if distance > max_common + 1e-9 {
            break;
        }
        points.push(AlignedPoint {
            distance_m: distance,
            a: a.at(distance),
            b: b.at(distance),
        });
        i += 1;
    }

    Ok(AlignedComparison { step_m: config.step_m, points })
}

/// Load both laps from the store and align them.
///
/// The laps may come from different sessions; comparing against a
/// reference lap recorded on an earlier day is the main use.
pub fn compare_laps(
    store: &SessionStore,
    lap_a: &Lap,
    lap_b: &Lap,
    config: &AlignConfig,
) -> Result<AlignedComparison> {
    let a = lap_samples(store, lap_a)?;
    let b = lap_samples(store, lap_b)?;
    Ok(align(&a, &b, config)?)
}

/// A lap's samples with distances rebased to start at zero, validated
/// monotonic within tolerance.
struct NormalizedLap<'a> {
    samples: &'a [TelemetrySample],
    start_distance: f64,
    /// Index of the left neighbour from the previous lookup. Grid distances
    /// are queried in ascending order, so the search resumes from here.
    cursor: std::cell::Cell<usize>,
}

impl<'a> NormalizedLap<'a> {
    fn new(samples: &'a [TelemetrySample], config: &AlignConfig) -> Result<Self, AlignError> {
        let lap_number = samples.first().map_or(0, |s| s.lap_number);
        if samples.len() < 2 {
            return Err(AlignError::EmptyLap { lap_number, samples: samples.len() });
        }

        let start = f64::from(samples[0].distance_traveled);
        let mut last = start;
        for (i, sample) in samples.iter().enumerate().skip(1) {
            let d = f64::from(sample.distance_traveled);
            if d < last - config.tolerance_m {
                return Err(AlignError::NonMonotonicDistance {
                    lap_number,
                    at: i,
                    from: last - start,
                    to: d - start,
                });
            }
            last = last.max(d);
        }

        Ok(Self { samples, start_distance: start, cursor: std::cell::Cell::new(0) })
    }

    fn distance(&self, index: usize) -> f64 {
        f64::from(self.samples[index].distance_traveled) - self.start_distance
    }

    fn final_distance(&self) -> f64 {
        self.distance(self.samples.len() - 1)
    }

    /// Channels at `distance`, linearly interpolated between the two
    /// bracketing samples. `distance` must not exceed the final distance.
    fn at(&self, distance: f64) -> ChannelPoint {
        let mut left = self.cursor.get();
        while left + 1 < self.samples.len() - 1 && self.distance(left + 1) <= distance {
            left += 1;
        }
        self.cursor.set(left);

        let right = left + 1;
        let d0 = self.distance(left);
        let d1 = self.distance(right);
        let span = d1 - d0;
        // Tolerated jitter can leave zero-width spans; hold the left sample.
        let t = if span > 0.0 { ((distance - d0) / span).clamp(0.0, 1.0) } else { 0.0 };

        let s0 = &self.samples[left];
        let s1 = &self.samples[right];
        let lerp = |a: f64, b: f64| a + (b - a) * t;

        ChannelPoint {
            speed_mps: lerp(f64::from(s0.speed), f64::from(s1.speed)),
            rpm: lerp(f64::from(s0.rpm), f64::from(s1.rpm)),
            throttle: lerp(f64::from(s0.throttle), f64::from(s1.throttle)),
            brake: lerp(f64::from(s0.brake), f64::from(s1.brake)),
            steering: lerp(f64::from(s0.steering), f64::from(s1.steering)),
            lap_time_ms: lerp(f64::from(s0.current_lap_time_ms), f64::from(s1.current_lap_time_ms)),
            position: [
                lerp(f64::from(s0.position.x), f64::from(s1.position.x)),
                lerp(f64::from(s0.position.y), f64::from(s1.position.y)),
                lerp(f64::from(s0.position.z), f64::from(s1.position.z)),
            ],
            gear: s0.gear,
        }
    }
}
