//! Lap extraction: turning a recorded session into discrete lap views.

use tracing::debug;

use crate::error::{Result, TelemetryError};
use crate::store::SessionStore;
use crate::types::{Lap, LapBoundary, LapTime, SessionId, TelemetrySample};

/// All laps of a session, in order.
///
/// Boundaries come from the persisted event index; when a session has none
/// (an index file lost or produced by a foreign tool) they are re-derived
/// by scanning the samples for `lap_number` transitions, which yields the
/// same result the recorder would have produced.
///
/// The trailing lap has no closing boundary and is flagged incomplete;
/// display it, but never select it as a best lap.
pub fn laps(store: &SessionStore, id: SessionId) -> Result<Vec<Lap>> {
    let total = store.durable_len(id)?;
    if total == 0 {
        return Ok(Vec::new());
    }

    let mut boundaries = store.boundaries(id)?;
    if boundaries.is_empty() {
        debug!("Session {id} has no boundary index, re-deriving from samples");
        boundaries = derive_boundaries(store, id, total)?;
    }
    // Boundary events are written through immediately while samples flush in
    // batches, so a live session can have a boundary ahead of the durable
    // watermark. Such a boundary opens a lap with no durable samples yet;
    // drop it and report the preceding lap as still in progress.
    boundaries.retain(|b| b.sequence < total);

    let mut result = Vec::with_capacity(boundaries.len());
    for (i, boundary) in boundaries.iter().enumerate() {
        let end = boundaries.get(i + 1).map_or(total, |next| next.sequence);
        if end <= boundary.sequence {
            // Boundary on the very last sample; nothing recorded for it.
            continue;
        }
        let complete = i + 1 < boundaries.len();
        let time = lap_time(store, id, boundary.sequence..end, boundaries.get(i + 1))?;
        result.push(Lap {
            session: id,
            lap_number: boundary.lap_number,
            sequences: boundary.sequence..end,
            time,
            complete,
        });
    }
    Ok(result)
}

/// Load the samples of one lap.
pub fn lap_samples(store: &SessionStore, lap: &Lap) -> Result<Vec<TelemetrySample>> {
    store.read_range(lap.session, lap.sequences.clone())?.collect()
}

/// The fastest complete lap, if any.
///
/// Incomplete laps are excluded: without a closing boundary their duration
/// is an estimate and not comparable.
pub fn best_lap(laps: &[Lap]) -> Option<&Lap> {
    laps.iter().filter(|lap| lap.complete).min_by_key(|lap| lap.time.ms())
}

/// Rebuild boundary events by scanning samples, mirroring the recorder's
/// detection: the first sample opens a lap, every strict increase opens the
/// next. Regressions are skipped here exactly as the recorder skips them.
fn derive_boundaries(
    store: &SessionStore,
    id: SessionId,
    total: u64,
) -> Result<Vec<LapBoundary>> {
    let mut boundaries = Vec::new();
    let mut last_lap: Option<u16> = None;

    for sample in store.read_range(id, 0..total)? {
        let sample = sample?;
        let is_boundary = match last_lap {
            None => true,
            Some(last) => sample.lap_number > last,
        };
        if is_boundary {
            boundaries.push(LapBoundary {
                sequence: sample.sequence,
                lap_number: sample.lap_number,
                wall_clock_us: sample.wall_clock_us,
            });
        }
        last_lap = Some(sample.lap_number);
    }
    Ok(boundaries)
}

/// Canonical lap duration.
///
/// The source reports a completed lap's time one lap late, on
/// `last_lap_time_ms` of the following lap's samples. Without a following
/// lap (or when the source reported zero) fall back to the timestamp span
/// of the lap itself, explicitly marked estimated.
fn lap_time(
    store: &SessionStore,
    id: SessionId,
    range: std::ops::Range<u64>,
    next_boundary: Option<&LapBoundary>,
) -> Result<LapTime> {
    if let Some(next) = next_boundary {
        let first_of_next = read_one(store, id, next.sequence)?;
        if first_of_next.last_lap_time_ms > 0 {
            return Ok(LapTime::Reported(first_of_next.last_lap_time_ms));
        }
    }

    let first = read_one(store, id, range.start)?;
    let last = read_one(store, id, range.end - 1)?;
    // Wrap-aware span; good enough for a partial lap display.
    let span_us = u64::from(last.timestamp_us.wrapping_sub(first.timestamp_us));
    Ok(LapTime::Estimated((span_us / 1000) as u32))
}

fn read_one(store: &SessionStore, id: SessionId, sequence: u64) -> Result<TelemetrySample> {
    store
        .read_range(id, sequence..sequence + 1)?
        .next()
        .transpose()?
        .ok_or_else(|| {
            TelemetryError::RangeUnavailable { session: id, range: sequence..sequence + 1 }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::test_utils::sample;
    use crate::types::{SessionEvent, SessionMeta, SourceIdent};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SessionStore {
        SessionStore::open(dir.path()).unwrap()
    }

    fn new_session(store: &SessionStore) -> SessionId {
        store
            .create_session(SessionMeta {
                start_wall_clock_us: 0,
                source: "test".to_string(),
                ident: SourceIdent {
                    car_ordinal: 1,
                    car_class: 1,
                    car_performance_index: 1,
                    track_ordinal: None,
                },
            })
            .unwrap()
    }

    /// Three laps of 10 samples each plus 5 trailing samples of lap 4.
    /// Lap N's reported time is 60_000 + N*1000 ms.
    fn populate(store: &SessionStore, id: SessionId, with_boundaries: bool) {
        let mut seq = 0u64;
        for lap in 1u16..=4 {
            let count = if lap == 4 { 5 } else { 10 };
            for i in 0..count {
                let mut s = sample(seq, lap, i as f32 * 100.0, 50.0);
                s.timestamp_us = seq as u32 * 100_000;
                // Completed-lap time reported one lap late.
                s.last_lap_time_ms = if lap > 1 { 60_000 + (lap as u32 - 1) * 1000 } else { 0 };
                store.append(id, &s).unwrap();
                if with_boundaries && i == 0 {
                    store
                        .append_event(
                            id,
                            &SessionEvent::Boundary(crate::types::LapBoundary {
                                sequence: seq,
                                lap_number: lap,
                                wall_clock_us: s.wall_clock_us,
                            }),
                        )
                        .unwrap();
                }
                seq += 1;
            }
        }
        store.flush(id).unwrap();
    }

    #[test]
    fn laps_are_contiguous_and_cover_the_session() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        populate(&store, id, true);

        let laps = laps(&store, id).unwrap();
        assert_eq!(laps.len(), 4);

        assert_eq!(laps[0].sequences, 0..10);
        assert_eq!(laps[1].sequences, 10..20);
        assert_eq!(laps[2].sequences, 20..30);
        assert_eq!(laps[3].sequences, 30..35);

        for pair in laps.windows(2) {
            assert_eq!(pair[0].sequences.end, pair[1].sequences.start);
        }
        assert!(laps[0].complete && laps[1].complete && laps[2].complete);
        assert!(!laps[3].complete);
    }

    #[test]
    fn lap_time_is_reported_one_lap_late() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        populate(&store, id, true);

        let laps = laps(&store, id).unwrap();
        assert_eq!(laps[0].time, LapTime::Reported(61_000));
        assert_eq!(laps[1].time, LapTime::Reported(62_000));
        assert_eq!(laps[2].time, LapTime::Reported(63_000));

        // Trailing partial lap: estimated from its own timestamp span.
        assert!(laps[3].time.is_estimated());
        // 4 inter-sample gaps of 100ms.
        assert_eq!(laps[3].time.ms(), 400);
    }

    #[test]
    fn boundaries_are_rederived_without_an_index() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        populate(&store, id, false);

        let derived = laps(&store, id).unwrap();
        assert_eq!(derived.len(), 4);
        assert_eq!(derived[1].sequences, 10..20);
        assert_eq!(derived[1].lap_number, 2);
    }

    #[test]
    fn best_lap_ignores_incomplete_laps() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        populate(&store, id, true);

        let laps = laps(&store, id).unwrap();
        // The partial lap 4 is much shorter than any complete lap, but must
        // not win.
        let best = best_lap(&laps).unwrap();
        assert_eq!(best.lap_number, 1);
        assert_eq!(best.time.ms(), 61_000);
    }

    #[test]
    fn boundary_ahead_of_durable_watermark_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);

        // Lap 1 fully durable.
        for seq in 0..5u64 {
            store.append(id, &sample(seq, 1, seq as f32 * 100.0, 50.0)).unwrap();
        }
        store
            .append_event(
                id,
                &SessionEvent::Boundary(crate::types::LapBoundary {
                    sequence: 0,
                    lap_number: 1,
                    wall_clock_us: 0,
                }),
            )
            .unwrap();
        store.flush(id).unwrap();

        // Lap 2 begins: the boundary event is written through immediately,
        // the sample itself is still buffered.
        store
            .append_event(
                id,
                &SessionEvent::Boundary(crate::types::LapBoundary {
                    sequence: 5,
                    lap_number: 2,
                    wall_clock_us: 0,
                }),
            )
            .unwrap();
        store.append(id, &sample(5, 2, 0.0, 50.0)).unwrap();

        // A live follower sees the durable prefix as one in-progress lap.
        let live = laps(&store, id).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].sequences, 0..5);
        assert!(!live[0].complete);

        // Once the sample flushes the second lap appears.
        store.flush(id).unwrap();
        let settled = laps(&store, id).unwrap();
        assert_eq!(settled.len(), 2);
        assert_eq!(settled[1].sequences, 5..6);
    }

    #[test]
    fn empty_session_yields_no_laps() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        assert!(laps(&store, id).unwrap().is_empty());
    }

    #[test]
    fn lap_samples_loads_exactly_the_range() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = new_session(&store);
        populate(&store, id, true);

        let all = laps(&store, id).unwrap();
        let samples = lap_samples(&store, &all[1]).unwrap();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[0].sequence, 10);
        assert!(samples.iter().all(|s| s.lap_number == 2));
    }
}
