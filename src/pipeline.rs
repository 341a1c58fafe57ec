//! Ingestion pipeline: network receive, decode, hand-off to the recorder.
//!
//! Two tasks joined by a bounded queue form the backpressure boundary of
//! the whole system: the receive loop pulls datagrams and decodes them, the
//! recorder task writes to the store. When the recorder cannot keep up the
//! queue drops its *oldest* entries: telemetry is a live stream where
//! freshness outweighs completeness, and a stale backlog is worse than a
//! gap.
//!
//! Malformed datagrams are counted and dropped; the source is an
//! uncontrolled external emitter and garbage bursts must never stop the
//! pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TelemetryError};
use crate::protocol;
use crate::recorder::{RecorderConfig, SessionRecorder};
use crate::store::SessionStore;
use crate::types::{SamplePacket, SessionId};

/// Largest datagram the receive loop accepts. Comfortably above every
/// known layout; oversized garbage still decodes to `UnknownLayout`.
const MAX_DATAGRAM: usize = 2048;

/// Abstracts where raw datagrams come from.
///
/// The production source is a UDP socket; tests inject scripted sources so
/// the full recording path runs without a network.
#[async_trait::async_trait]
pub trait DatagramSource: Send + 'static {
    /// Receive the next datagram.
    ///
    /// Returns `Ok(None)` when the source has ended (scripted sources);
    /// a live socket never ends on its own.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// Human-readable label recorded as the session's source identifier.
    fn label(&self) -> String;
}

/// UDP listener for the simulator's "data out" stream.
///
/// The socket is owned by the handle returned from [`Pipeline::start`];
/// there is no ambient or static listener state.
pub struct UdpSource {
    socket: UdpSocket,
    label: String,
    buf: Vec<u8>,
}

impl UdpSource {
    /// Bind a UDP listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TelemetryError::source_error_with("binding UDP socket", Box::new(e)))?;
        let label = socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "udp:unknown".to_string());
        info!("Listening for telemetry on {label}");
        Ok(Self { socket, label, buf: vec![0u8; MAX_DATAGRAM] })
    }

    /// The bound local address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| TelemetryError::source_error_with("reading local address", Box::new(e)))
    }
}

#[async_trait::async_trait]
impl DatagramSource for UdpSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let (len, _peer) = self
            .socket
            .recv_from(&mut self.buf)
            .await
            .map_err(|e| TelemetryError::source_error_with("receiving datagram", Box::new(e)))?;
        Ok(Some(self.buf[..len].to_vec()))
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

/// Tuning knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the bounded queue between receive loop and recorder.
    /// On overflow the oldest pending samples are dropped.
    pub queue_capacity: usize,
    /// How long `stop` waits for the tasks to drain before giving up.
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 512, stop_timeout: Duration::from_secs(5) }
    }
}

/// Shared ingestion counters, updated lock-free from both tasks.
#[derive(Debug, Default)]
pub struct IngestCounters {
    received: AtomicU64,
    decode_errors: AtomicU64,
    queue_dropped: AtomicU64,
    duplicates: AtomicU64,
    recorded: AtomicU64,
}

impl IngestCounters {
    pub(crate) fn add_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_queue_dropped(&self, n: u64) {
        self.queue_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate ingestion statistics.
///
/// Decode errors and queue drops surface here as drop-rate metrics; none of
/// them are ever fatal to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub received: u64,
    pub decode_errors: u64,
    pub queue_dropped: u64,
    pub duplicates: u64,
    pub recorded: u64,
}

/// Owner of a running ingestion pipeline.
///
/// Dropping the handle without calling [`stop`](IngestHandle::stop) aborts
/// nothing: cancel explicitly to get a clean flush and session close.
pub struct IngestHandle {
    cancel: CancellationToken,
    counters: Arc<IngestCounters>,
    session_rx: watch::Receiver<Option<SessionId>>,
    receive_task: JoinHandle<()>,
    recorder_task: JoinHandle<()>,
    stop_timeout: Duration,
}

impl IngestHandle {
    /// The session being recorded, once the first sample has arrived.
    pub fn session(&self) -> Option<SessionId> {
        *self.session_rx.borrow()
    }

    /// Wait until the session exists (first decodable datagram arrived).
    pub async fn wait_for_session(&self) -> Result<SessionId> {
        let mut rx = self.session_rx.clone();
        loop {
            if let Some(session) = *rx.borrow_and_update() {
                return Ok(session);
            }
            rx.changed()
                .await
                .map_err(|_| TelemetryError::source_error("pipeline ended before any sample"))?;
        }
    }

    /// Current counter snapshot.
    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Stop the pipeline: close the socket loop, drain within the bounded
    /// timeout, flush and close the session. In-flight datagrams are
    /// discarded, not forced through.
    pub async fn stop(self) -> Result<IngestStats> {
        self.cancel.cancel();

        let drain = async {
            let _ = self.receive_task.await;
            let _ = self.recorder_task.await;
        };
        tokio::time::timeout(self.stop_timeout, drain)
            .await
            .map_err(|_| TelemetryError::Timeout { duration: self.stop_timeout })?;

        Ok(self.counters.snapshot())
    }
}

/// Spawns and wires the ingestion tasks.
pub struct Pipeline;

impl Pipeline {
    /// Start ingesting from `source` into `store`.
    ///
    /// The session is created lazily when the first decodable datagram
    /// arrives, so an idle listener leaves no empty session files behind.
    pub fn start<S: DatagramSource>(
        source: S,
        store: Arc<SessionStore>,
        config: PipelineConfig,
        recorder_config: RecorderConfig,
    ) -> IngestHandle {
        let cancel = CancellationToken::new();
        let counters = Arc::new(IngestCounters::default());
        let (session_tx, session_rx) = watch::channel(None);

        // Broadcast ring as the bounded queue: a lagging recorder skips the
        // oldest entries, which is exactly the drop policy we want.
        let (queue_tx, queue_rx) = broadcast::channel(config.queue_capacity.max(1));

        let recorder =
            SessionRecorder::new(store, recorder_config, source.label(), session_tx);
        let recorder_task = tokio::spawn(recorder.run(
            queue_rx,
            cancel.clone(),
            Arc::clone(&counters),
        ));

        let receive_task = tokio::spawn(Self::receive_loop(
            source,
            queue_tx,
            cancel.clone(),
            Arc::clone(&counters),
        ));

        IngestHandle {
            cancel,
            counters,
            session_rx,
            receive_task,
            recorder_task,
            stop_timeout: config.stop_timeout,
        }
    }

    async fn receive_loop<S: DatagramSource>(
        mut source: S,
        queue: broadcast::Sender<SamplePacket>,
        cancel: CancellationToken,
        counters: Arc<IngestCounters>,
    ) {
        info!("Receive loop started");
        let mut error_count = 0u32;
        const MAX_ERRORS: u32 = 10;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Receive loop cancelled");
                    break;
                }
                result = source.recv() => result,
            };

            match result {
                Ok(Some(datagram)) => {
                    error_count = 0;
                    counters.add_received();

                    match protocol::decode(&datagram) {
                        Ok(sample) => {
                            trace!(
                                "Datagram decoded: ts={} lap={}",
                                sample.timestamp_us, sample.lap_number
                            );
                            let packet = SamplePacket::new(datagram, sample, unix_now_us());
                            if queue.send(packet).is_err() {
                                // Recorder gone (store failure); no point
                                // pulling datagrams we cannot record.
                                warn!("Recorder stopped, ending receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            counters.add_decode_error();
                            trace!("Dropped malformed datagram: {e}");
                        }
                    }
                }
                Ok(None) => {
                    info!("Datagram source ended");
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!("Source error ({error_count}/{MAX_ERRORS}): {e}");
                    if error_count >= MAX_ERRORS {
                        error!("Too many source errors, ending receive loop");
                        break;
                    }
                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        let stats = counters.snapshot();
        info!(
            "Receive loop ended: {} received, {} decode errors",
            stats.received, stats.decode_errors
        );
    }
}

/// Arrival wall-clock time in unix microseconds.
pub(crate) fn unix_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketLayout, decode};
    use crate::store::SessionStore;
    use crate::test_utils::{PacketSpec, build_packet};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Source that plays a fixed script of datagrams and then ends.
    struct ScriptedSource {
        datagrams: VecDeque<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl DatagramSource for ScriptedSource {
        async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.datagrams.pop_front())
        }

        fn label(&self) -> String {
            "scripted".to_string()
        }
    }

    fn dash(spec: &PacketSpec) -> Vec<u8> {
        build_packet(PacketLayout::Dash, spec)
    }

    #[tokio::test]
    async fn malformed_datagrams_are_counted_and_dropped() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());

        let mut datagrams = VecDeque::new();
        for i in 0..5u32 {
            datagrams.push_back(dash(&PacketSpec {
                timestamp_us: 1000 + i * 16_667,
                distance: i as f32,
                ..PacketSpec::default()
            }));
            // Interleave garbage of assorted shapes.
            datagrams.push_back(vec![0xAB; 50]);
            datagrams.push_back(vec![0xCD; 400]);
        }

        let handle = Pipeline::start(
            ScriptedSource { datagrams },
            Arc::clone(&store),
            PipelineConfig::default(),
            RecorderConfig::default(),
        );
        let session = handle.wait_for_session().await.unwrap();
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.received, 15);
        assert_eq!(stats.decode_errors, 10);
        assert_eq!(stats.recorded, 5);
        assert_eq!(store.durable_len(session).unwrap(), 5);
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest_and_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let (session_tx, _session_rx) = watch::channel(None);
        let counters = Arc::new(IngestCounters::default());
        let cancel = CancellationToken::new();

        // Fill the bounded queue past capacity before the recorder task
        // starts draining, emulating a stalled write path.
        let (queue_tx, queue_rx) = broadcast::channel(4);
        for i in 0..20u32 {
            let raw = dash(&PacketSpec {
                timestamp_us: 1000 + i * 16_667,
                distance: i as f32 * 10.0,
                ..PacketSpec::default()
            });
            let sample = decode(&raw).unwrap();
            queue_tx.send(SamplePacket::new(raw, sample, i as i64)).unwrap();
        }
        drop(queue_tx);

        let recorder = SessionRecorder::new(
            Arc::clone(&store),
            RecorderConfig::default(),
            "stalled",
            session_tx,
        );
        recorder.run(queue_rx, cancel, Arc::clone(&counters)).await;

        let stats = counters.snapshot();
        assert_eq!(stats.queue_dropped, 16);
        assert_eq!(stats.recorded, 4);

        // The retained samples are the newest ones.
        let session = store.sessions()[0];
        let samples: Vec<_> = store
            .read_range(session, 0..stats.recorded)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(samples.first().map(|s| s.distance_traveled), Some(160.0));
        assert_eq!(samples.last().map(|s| s.distance_traveled), Some(190.0));
    }

    #[tokio::test]
    async fn udp_source_round_trip() {
        let source = UdpSource::bind("127.0.0.1:0").await.unwrap();
        let addr = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = dash(&PacketSpec::default());
        sender.send_to(&payload, addr).await.unwrap();

        let mut source = source;
        let received = source.recv().await.unwrap().unwrap();
        assert_eq!(received, payload);
        assert_eq!(source.label(), addr.to_string());
    }

    #[tokio::test]
    async fn stop_without_any_datagrams_creates_no_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());

        let handle = Pipeline::start(
            ScriptedSource { datagrams: VecDeque::new() },
            Arc::clone(&store),
            PipelineConfig::default(),
            RecorderConfig::default(),
        );
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.received, 0);
        assert!(store.sessions().is_empty());
    }
}
