//! Durable, append-only session store.
//!
//! One directory holds any number of sessions, each as a samples file plus
//! an event index file (see [`format`]). Appends are serialized per session
//! behind a single writer; concurrent readers only ever observe the durable
//! prefix, published through a `watch` channel, so a reader can follow a
//! live recording without seeing gaps or reordering.
//!
//! A session whose write path fails transitions to [`SessionState::Degraded`]:
//! further appends are rejected, already-flushed samples stay readable.

pub(crate) mod format;
mod reader;

pub use reader::RangeReader;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, TelemetryError};
use crate::stream::SampleStream;
use crate::types::{
    Anomaly, LapBoundary, SessionEvent, SessionId, SessionMeta, SessionState, TelemetrySample,
};

/// Ring capacity of the per-session live broadcast channel. Slow
/// subscribers skip ahead rather than stalling the writer.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

struct SessionWriter {
    samples: BufWriter<File>,
    events: File,
    /// Records appended, including those still buffered.
    appended: u64,
}

struct SessionShared {
    id: SessionId,
    meta: SessionMeta,
    samples_path: PathBuf,
    events_path: PathBuf,
    /// Byte offset of the first record in the samples file.
    data_start: u64,
    state: Mutex<SessionState>,
    /// Present while the session is open for appends.
    writer: Mutex<Option<SessionWriter>>,
    /// Count of durable (flushed) records; readers never go past this.
    watermark: watch::Sender<u64>,
    live: broadcast::Sender<Arc<TelemetrySample>>,
    /// Event cache; `None` until loaded from disk for reopened sessions.
    events: Mutex<Option<Vec<SessionEvent>>>,
}

/// Directory-rooted store of recorded sessions.
///
/// Cheap to share: wrap in an [`Arc`] and hand clones to the recorder and
/// any number of readers.
pub struct SessionStore {
    root: PathBuf,
    sessions: Mutex<BTreeMap<SessionId, Arc<SessionShared>>>,
}

impl SessionStore {
    /// Open a store rooted at `root`, creating the directory if needed and
    /// registering sessions recorded by earlier runs.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| TelemetryError::store_error("creating store root", &root, e))?;

        let store = Self { root, sessions: Mutex::new(BTreeMap::new()) };
        store.rescan()?;
        Ok(store)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register sessions already on disk. Sessions from earlier runs come
    /// back read-only; a torn trailing record from an unclean shutdown is
    /// ignored.
    fn rescan(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| TelemetryError::store_error("scanning store root", &self.root, e))?;

        for entry in entries {
            let entry = entry
                .map_err(|e| TelemetryError::store_error("scanning store root", &self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("samples") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
                .map(SessionId::from_raw)
            else {
                warn!("Ignoring unrecognized file in store: {}", path.display());
                continue;
            };

            match self.load_existing(id, &path) {
                Ok(shared) => {
                    debug!("Registered existing session {id}");
                    lock(&self.sessions).insert(id, Arc::new(shared));
                }
                Err(e) => {
                    // One bad file must not hide the rest of the store.
                    warn!("Skipping unreadable session file {}: {e}", path.display());
                }
            }
        }
        Ok(())
    }

    fn load_existing(&self, id: SessionId, samples_path: &Path) -> Result<SessionShared> {
        let mut file = File::open(samples_path)
            .map_err(|e| TelemetryError::store_error("opening samples file", samples_path, e))?;
        let mut fixed = [0u8; format::HEADER_FIXED_LEN];
        file.read_exact(&mut fixed)
            .map_err(|e| TelemetryError::store_error("reading samples header", samples_path, e))?;
        let total = format::header_total_len(&fixed)?;

        let mut header = vec![0u8; total];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| TelemetryError::store_error("reading samples header", samples_path, e))?;
        file.read_exact(&mut header)
            .map_err(|e| TelemetryError::store_error("reading samples header", samples_path, e))?;
        let meta = format::decode_header(&header)?;

        let file_len = file
            .metadata()
            .map_err(|e| TelemetryError::store_error("reading samples metadata", samples_path, e))?
            .len();
        let durable = (file_len - total as u64) / format::RECORD_SIZE as u64;

        let (watermark, _) = watch::channel(durable);
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Ok(SessionShared {
            id,
            meta,
            samples_path: samples_path.to_path_buf(),
            events_path: self.events_path(id),
            data_start: total as u64,
            state: Mutex::new(SessionState::Closed),
            writer: Mutex::new(None),
            watermark,
            live,
            events: Mutex::new(None),
        })
    }

    fn samples_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.samples"))
    }

    fn events_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.laps"))
    }

    /// Create a new session open for appends.
    ///
    /// The id is derived from the session's start wall-clock time, nudged
    /// forward on the (clock-step) chance of a collision.
    pub fn create_session(&self, meta: SessionMeta) -> Result<SessionId> {
        let mut sessions = lock(&self.sessions);
        let mut raw = meta.start_wall_clock_us.max(0) as u64;
        while sessions.contains_key(&SessionId::from_raw(raw)) {
            raw += 1;
        }
        let id = SessionId::from_raw(raw);

        let samples_path = self.samples_path(id);
        let events_path = self.events_path(id);

        let header = format::encode_header(&meta);
        let mut samples = BufWriter::new(
            OpenOptions::new().create_new(true).write(true).open(&samples_path).map_err(|e| {
                TelemetryError::store_error("creating samples file", &samples_path, e)
            })?,
        );
        samples
            .write_all(&header)
            .and_then(|_| samples.flush())
            .map_err(|e| TelemetryError::store_error("writing samples header", &samples_path, e))?;

        let mut events = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&events_path)
            .map_err(|e| TelemetryError::store_error("creating events file", &events_path, e))?;
        events
            .write_all(&format::events_header())
            .map_err(|e| TelemetryError::store_error("writing events header", &events_path, e))?;

        let (watermark, _) = watch::channel(0);
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let shared = SessionShared {
            id,
            meta,
            samples_path,
            events_path,
            data_start: header.len() as u64,
            state: Mutex::new(SessionState::Active),
            writer: Mutex::new(Some(SessionWriter { samples, events, appended: 0 })),
            watermark,
            live,
            events: Mutex::new(Some(Vec::new())),
        };

        info!("Created session {id} in {}", self.root.display());
        sessions.insert(id, Arc::new(shared));
        Ok(id)
    }

    fn shared(&self, id: SessionId) -> Result<Arc<SessionShared>> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or(TelemetryError::SessionNotFound { session: id })
    }

    /// Append one sample. The sample becomes visible to live subscribers
    /// immediately and to range readers after the next flush.
    pub fn append(&self, id: SessionId, sample: &TelemetrySample) -> Result<()> {
        let shared = self.shared(id)?;
        shared.check_writable()?;

        let mut writer_slot = lock(&shared.writer);
        let Some(writer) = writer_slot.as_mut() else {
            return Err(TelemetryError::SessionClosed { session: id });
        };

        let record = format::encode_record(sample);
        if let Err(e) = writer.samples.write_all(&record) {
            drop(writer_slot);
            shared.degrade();
            return Err(TelemetryError::store_error(
                "appending sample",
                &shared.samples_path,
                e,
            ));
        }
        writer.appended += 1;
        drop(writer_slot);

        // Live followers get the sample before it is durable; that is fine,
        // they are a display path, not a replay path.
        let _ = shared.live.send(Arc::new(*sample));
        Ok(())
    }

    /// Append a lap boundary or anomaly event. Events are written through
    /// immediately; they are rare compared to samples.
    pub fn append_event(&self, id: SessionId, event: &SessionEvent) -> Result<()> {
        let shared = self.shared(id)?;
        shared.check_writable()?;

        let mut writer_slot = lock(&shared.writer);
        let Some(writer) = writer_slot.as_mut() else {
            return Err(TelemetryError::SessionClosed { session: id });
        };

        if let Err(e) = writer.events.write_all(&format::encode_event(event)) {
            drop(writer_slot);
            shared.degrade();
            return Err(TelemetryError::store_error("appending event", &shared.events_path, e));
        }
        drop(writer_slot);

        if let Some(cache) = lock(&shared.events).as_mut() {
            cache.push(*event);
        }
        Ok(())
    }

    /// Flush buffered samples to disk and advance the durable watermark.
    pub fn flush(&self, id: SessionId) -> Result<()> {
        let shared = self.shared(id)?;
        let mut writer_slot = lock(&shared.writer);
        let Some(writer) = writer_slot.as_mut() else {
            // Nothing buffered in a closed session.
            return Ok(());
        };

        if let Err(e) = writer.samples.flush() {
            drop(writer_slot);
            shared.degrade();
            return Err(TelemetryError::store_error("flushing samples", &shared.samples_path, e));
        }
        let durable = writer.appended;
        drop(writer_slot);

        shared.watermark.send_replace(durable);
        Ok(())
    }

    /// Close a session: flush, fsync both files, reject further appends.
    ///
    /// After `close` returns, every previously appended sample is
    /// retrievable across a process restart.
    pub fn close(&self, id: SessionId) -> Result<()> {
        let shared = self.shared(id)?;
        self.flush(id)?;

        let mut writer_slot = lock(&shared.writer);
        if let Some(writer) = writer_slot.take() {
            let samples = writer.samples.into_inner().map_err(|e| {
                TelemetryError::store_error(
                    "closing samples file",
                    &shared.samples_path,
                    e.into_error(),
                )
            })?;
            samples.sync_all().map_err(|e| {
                TelemetryError::store_error("syncing samples file", &shared.samples_path, e)
            })?;
            writer.events.sync_all().map_err(|e| {
                TelemetryError::store_error("syncing events file", &shared.events_path, e)
            })?;
        }
        drop(writer_slot);

        let mut state = lock(&shared.state);
        if *state == SessionState::Active {
            *state = SessionState::Closed;
        }
        info!("Closed session {id} ({} samples)", *shared.watermark.borrow());
        Ok(())
    }

    /// All sessions currently known to the store, oldest first.
    pub fn sessions(&self) -> Vec<SessionId> {
        lock(&self.sessions).keys().copied().collect()
    }

    pub fn meta(&self, id: SessionId) -> Result<SessionMeta> {
        Ok(self.shared(id)?.meta.clone())
    }

    pub fn state(&self, id: SessionId) -> Result<SessionState> {
        Ok(*lock(&self.shared(id)?.state))
    }

    /// Number of durable samples; also the next unassigned sequence.
    pub fn durable_len(&self, id: SessionId) -> Result<u64> {
        Ok(*self.shared(id)?.watermark.borrow())
    }

    /// All recorded events (boundaries and anomalies) in append order.
    pub fn events(&self, id: SessionId) -> Result<Vec<SessionEvent>> {
        let shared = self.shared(id)?;
        let mut cache = lock(&shared.events);
        if let Some(events) = cache.as_ref() {
            return Ok(events.clone());
        }

        let buf = fs::read(&shared.events_path)
            .map_err(|e| TelemetryError::store_error("reading events file", &shared.events_path, e))?;
        let events = format::decode_events(&buf)?;
        *cache = Some(events.clone());
        Ok(events)
    }

    /// Lap boundaries only, in sequence order.
    pub fn boundaries(&self, id: SessionId) -> Result<Vec<LapBoundary>> {
        Ok(self
            .events(id)?
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Boundary(b) => Some(b),
                SessionEvent::Anomaly(_) => None,
            })
            .collect())
    }

    /// Data-quality anomalies only, in sequence order.
    pub fn anomalies(&self, id: SessionId) -> Result<Vec<Anomaly>> {
        Ok(self
            .events(id)?
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Anomaly(a) => Some(a),
                SessionEvent::Boundary(_) => None,
            })
            .collect())
    }

    /// Lazy forward-only reader over `range`, clamped to the durable
    /// watermark at call time. Restart with a later range to follow a live
    /// session.
    pub fn read_range(&self, id: SessionId, range: Range<u64>) -> Result<RangeReader> {
        let shared = self.shared(id)?;
        let durable = *shared.watermark.borrow();
        let start = range.start.min(durable);
        let end = range.end.min(durable);

        let file = File::open(&shared.samples_path)
            .map_err(|e| TelemetryError::store_error("opening samples file", &shared.samples_path, e))?;
        RangeReader::new(file, shared.samples_path.clone(), shared.data_start, start..end)
    }

    /// Subscribe to samples as they are appended.
    ///
    /// The stream is lag-tolerant: a subscriber that falls behind the
    /// broadcast ring skips ahead instead of stalling the writer.
    pub fn subscribe(&self, id: SessionId) -> Result<SampleStream> {
        let shared = self.shared(id)?;
        Ok(SampleStream::new(shared.live.subscribe()))
    }

    /// Watch the durable watermark, e.g. to poll a live session with
    /// `read_range` without busy-looping.
    pub fn watch_durable(&self, id: SessionId) -> Result<watch::Receiver<u64>> {
        Ok(self.shared(id)?.watermark.subscribe())
    }
}

impl SessionShared {
    fn check_writable(&self) -> Result<()> {
        match *lock(&self.state) {
            SessionState::Active => Ok(()),
            SessionState::Degraded => Err(TelemetryError::SessionDegraded { session: self.id }),
            SessionState::Closed => Err(TelemetryError::SessionClosed { session: self.id }),
        }
    }

    /// Transition to read-only after a write failure. The durable prefix
    /// stays readable; the writer is dropped so nothing half-written is
    /// flushed later.
    fn degrade(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Active {
            warn!("Session {} degraded after write failure; now read-only", self.id);
            *state = SessionState::Degraded;
        }
        drop(state);
        *lock(&self.writer) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
