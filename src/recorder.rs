//! Session recorder: turns the arrival stream into a durable session.
//!
//! The recorder owns everything that needs session-scoped history: sequence
//! assignment, timestamp wraparound correction, duplicate suppression, lap
//! boundary detection, and anomaly flagging. It sits behind the ingestion
//! queue on its own task so a slow disk never blocks the network receive
//! loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::pipeline::IngestCounters;
use crate::protocol;
use crate::store::SessionStore;
use crate::types::{
    Anomaly, AnomalyKind, LapBoundary, SamplePacket, SessionEvent, SessionId, SessionMeta,
    SourceIdent,
};

/// Tuning knobs for the recorder's write path and heuristics.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Flush after this many appended samples...
    pub flush_batch: usize,
    /// ...or after this long, whichever comes first.
    pub flush_interval: Duration,
    /// Forward logical-timestamp jump beyond this is flagged as an anomaly;
    /// it cannot be a single wrap at the stream's cadence.
    pub timestamp_jump_us: u64,
    /// Distance reversal within a lap beyond this is flagged.
    pub distance_tolerance_m: f32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_batch: 60,
            flush_interval: Duration::from_millis(250),
            timestamp_jump_us: 60_000_000,
            distance_tolerance_m: 1.0,
        }
    }
}

/// Per-session recording state.
///
/// Sequence numbers are assigned in arrival order: UDP gives no ordering
/// guarantee and consumers need a consistent replayable sequence, not "true"
/// chronology. The raw timestamp is only used for duplicate and gap
/// heuristics, never for ordering.
pub struct SessionRecorder {
    store: Arc<SessionStore>,
    config: RecorderConfig,
    source_label: String,
    session_tx: watch::Sender<Option<SessionId>>,
    session: Option<SessionId>,
    next_sequence: u64,
    unflushed: usize,
    /// Raw payload of the previous datagram, for duplicate suppression.
    last_raw: Option<Arc<[u8]>>,
    last_raw_ts: Option<u32>,
    /// Accumulated wrap offset added to raw timestamps.
    ts_epoch: u64,
    last_logical_ts: Option<u64>,
    last_lap: Option<u16>,
    last_distance: Option<f32>,
}

impl SessionRecorder {
    pub fn new(
        store: Arc<SessionStore>,
        config: RecorderConfig,
        source_label: impl Into<String>,
        session_tx: watch::Sender<Option<SessionId>>,
    ) -> Self {
        Self {
            store,
            config,
            source_label: source_label.into(),
            session_tx,
            session: None,
            next_sequence: 0,
            unflushed: 0,
            last_raw: None,
            last_raw_ts: None,
            ts_epoch: 0,
            last_logical_ts: None,
            last_lap: None,
            last_distance: None,
        }
    }

    /// The session this recorder writes to, once the first sample arrived.
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Process one arrived packet. Returns true if the sample was appended,
    /// false if it was suppressed as a duplicate.
    pub fn on_packet(&mut self, packet: &SamplePacket, counters: &IngestCounters) -> Result<bool> {
        let logical_ts = self.logical_timestamp(packet.sample.timestamp_us);

        // The source resends bit-identical frames under loss on its side;
        // same payload with a non-advancing timestamp is a retransmission.
        if let (Some(last_raw), Some(last_ts)) = (&self.last_raw, self.last_logical_ts)
            && **last_raw == *packet.raw
            && logical_ts <= last_ts
        {
            counters.add_duplicate();
            debug!("Suppressed duplicate retransmission at ts {logical_ts}");
            return Ok(false);
        }

        let session = match self.session {
            Some(session) => session,
            None => self.create_session(packet)?,
        };

        let mut sample = packet.sample;
        sample.sequence = self.next_sequence;
        sample.wall_clock_us = packet.received_us;

        self.detect_anomalies(session, &sample, logical_ts)?;
        self.detect_lap_boundary(session, &sample)?;

        self.store.append(session, &sample)?;
        self.next_sequence += 1;
        self.unflushed += 1;
        counters.add_recorded();

        self.last_raw = Some(Arc::clone(&packet.raw));
        self.last_raw_ts = Some(packet.sample.timestamp_us);
        self.last_logical_ts = Some(logical_ts);
        self.last_lap = Some(sample.lap_number);
        self.last_distance = Some(sample.distance_traveled);

        if self.unflushed >= self.config.flush_batch {
            self.flush()?;
        }
        Ok(true)
    }

    /// Flush batched samples so readers can see them.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(session) = self.session
            && self.unflushed > 0
        {
            self.store.flush(session)?;
            self.unflushed = 0;
        }
        Ok(())
    }

    /// Flush and close the session. In-flight samples still in the queue
    /// are lost, which is acceptable: they were never durable.
    pub fn finish(mut self) -> Result<Option<SessionId>> {
        self.flush()?;
        if let Some(session) = self.session {
            self.store.close(session)?;
            return Ok(Some(session));
        }
        Ok(None)
    }

    fn create_session(&mut self, packet: &SamplePacket) -> Result<SessionId> {
        // The raw datagram already decoded once, so identity extraction
        // cannot fail here; fall back to zeros rather than dropping data.
        let ident = protocol::decode_ident(&packet.raw).unwrap_or(SourceIdent {
            car_ordinal: 0,
            car_class: 0,
            car_performance_index: 0,
            track_ordinal: None,
        });
        let session = self.store.create_session(SessionMeta {
            start_wall_clock_us: packet.received_us,
            source: self.source_label.clone(),
            ident,
        })?;
        info!("Recording session {session} (car {})", ident.car_ordinal);
        self.session = Some(session);
        self.session_tx.send_replace(Some(session));
        Ok(session)
    }

    /// Reconstruct a monotonic logical timestamp from the wrapping raw
    /// counter. A backward move of more than half the counter range is a
    /// wrap; a smaller one is an out-of-order burst and passes through.
    fn logical_timestamp(&mut self, raw: u32) -> u64 {
        if let Some(prev) = self.last_raw_ts
            && raw < prev
            && prev - raw > u32::MAX / 2
        {
            debug!("Timestamp counter wrapped at raw {prev} -> {raw}");
            self.ts_epoch += 1 << 32;
        }
        self.ts_epoch + u64::from(raw)
    }

    fn detect_anomalies(
        &mut self,
        session: SessionId,
        sample: &crate::types::TelemetrySample,
        logical_ts: u64,
    ) -> Result<()> {
        if let Some(last_ts) = self.last_logical_ts {
            let delta = logical_ts.saturating_sub(last_ts);
            if delta > self.config.timestamp_jump_us {
                warn!("Timestamp discontinuity of {delta}us at sequence {}", sample.sequence);
                self.store.append_event(
                    session,
                    &SessionEvent::Anomaly(Anomaly {
                        sequence: sample.sequence,
                        kind: AnomalyKind::TimestampJump { delta_us: delta },
                    }),
                )?;
            }
        }

        if let (Some(last_lap), Some(last_distance)) = (self.last_lap, self.last_distance)
            && sample.lap_number == last_lap
            && sample.distance_traveled < last_distance - self.config.distance_tolerance_m
        {
            warn!(
                "Distance reversed {:.1}m -> {:.1}m at sequence {}",
                last_distance, sample.distance_traveled, sample.sequence
            );
            self.store.append_event(
                session,
                &SessionEvent::Anomaly(Anomaly {
                    sequence: sample.sequence,
                    kind: AnomalyKind::DistanceReversal {
                        from_m: last_distance,
                        to_m: sample.distance_traveled,
                    },
                }),
            )?;
        }
        Ok(())
    }

    fn detect_lap_boundary(
        &mut self,
        session: SessionId,
        sample: &crate::types::TelemetrySample,
    ) -> Result<()> {
        match self.last_lap {
            // First sample of the session opens the first lap.
            None => self.store.append_event(
                session,
                &SessionEvent::Boundary(LapBoundary {
                    sequence: sample.sequence,
                    lap_number: sample.lap_number,
                    wall_clock_us: sample.wall_clock_us,
                }),
            ),
            Some(last) if sample.lap_number > last => {
                debug!("Lap boundary {last} -> {} at sequence {}", sample.lap_number, sample.sequence);
                self.store.append_event(
                    session,
                    &SessionEvent::Boundary(LapBoundary {
                        sequence: sample.sequence,
                        lap_number: sample.lap_number,
                        wall_clock_us: sample.wall_clock_us,
                    }),
                )
            }
            Some(last) if sample.lap_number < last => {
                // Could be a pit restart or a source reset; flagged, not
                // silently split into a new session.
                warn!(
                    "Lap number regressed {last} -> {} at sequence {}",
                    sample.lap_number, sample.sequence
                );
                self.store.append_event(
                    session,
                    &SessionEvent::Anomaly(Anomaly {
                        sequence: sample.sequence,
                        kind: AnomalyKind::LapRegression { from: last, to: sample.lap_number },
                    }),
                )
            }
            Some(_) => Ok(()),
        }
    }

    /// Task loop: drain the ingestion queue, flush on a timer, close the
    /// session on cancellation.
    pub(crate) async fn run(
        mut self,
        mut rx: broadcast::Receiver<SamplePacket>,
        cancel: CancellationToken,
        counters: Arc<IngestCounters>,
    ) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Recorder cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        error!("Flush failed, stopping recorder: {e}");
                        break;
                    }
                }
                result = rx.recv() => match result {
                    Ok(packet) => {
                        if let Err(e) = self.on_packet(&packet, &counters) {
                            // Store failures are fatal to this session only;
                            // the session is now degraded and read-only.
                            error!("Append failed, stopping recorder: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // The bounded queue overflowed while we were busy;
                        // the oldest pending samples were dropped in favor
                        // of fresh ones.
                        counters.add_queue_dropped(n);
                        debug!("Ingestion queue overflowed, dropped {n} stale samples");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Ingestion queue closed");
                        break;
                    }
                },
            }
        }

        match self.finish() {
            Ok(Some(session)) => info!("Recorder finished, session {session} closed"),
            Ok(None) => info!("Recorder finished, no samples ever arrived"),
            Err(e) => error!("Failed to close session cleanly: {e}"),
        }
    }
}
