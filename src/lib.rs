//! UDP racing-telemetry capture and lap comparison.
//!
//! Stint listens for the length-keyed UDP telemetry stream that racing
//! titles emit, decodes each datagram into a typed sample, and records
//! sessions to an append-only on-disk store with a durable lap index.
//! Recorded laps can be compared by resampling both onto a shared
//! distance grid.
//!
//! # Features
//!
//! - **Capture**: bounded-queue UDP ingestion with drop accounting
//! - **Decode**: pure, total datagram decoding for all known layouts
//! - **Persist**: crash-tolerant fixed-record session files
//! - **Compare**: distance-aligned lap overlays with time deltas
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stint::Stint;
//!
//! #[tokio::main]
//! async fn main() -> stint::Result<()> {
//!     let store = Stint::open_store("./sessions")?;
//!     let handle = Stint::record("0.0.0.0:9999", store.clone()).await?;
//!
//!     // ... drive ...
//!
//!     let stats = handle.stop().await?;
//!     println!("recorded {} samples", stats.recorded);
//!     Ok(())
//! }
//! ```

pub mod align;
mod error;
pub mod extractor;
pub mod pipeline;
pub mod protocol;
pub mod recorder;
pub mod store;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Core exports
pub use error::*;
pub use types::*;

pub use align::{AlignConfig, AlignedComparison, AlignedPoint, ChannelPoint, align, compare_laps};
pub use extractor::{best_lap, lap_samples, laps};
pub use pipeline::{
    DatagramSource, IngestHandle, IngestStats, Pipeline, PipelineConfig, UdpSource,
};
pub use recorder::RecorderConfig;
pub use store::SessionStore;
pub use stream::SampleStream;

use std::path::Path;
use std::sync::Arc;

use tokio::net::ToSocketAddrs;

/// Unified entry point for recording and reviewing sessions.
///
/// The free functions in [`extractor`] and [`align`] cover review; `Stint`
/// wires the capture side together with defaults.
///
/// # Examples
///
/// ## Record, then compare the two best laps
/// ```rust,no_run
/// use stint::{AlignConfig, Stint};
///
/// #[tokio::main]
/// async fn main() -> stint::Result<()> {
///     let store = Stint::open_store("./sessions")?;
///     let handle = Stint::record("0.0.0.0:9999", store.clone()).await?;
///     let session = handle.wait_for_session().await?;
///     // ... later ...
///     handle.stop().await?;
///
///     let laps = stint::laps(&store, session)?;
///     if let [a, b, ..] = laps.as_slice() {
///         let cmp = stint::compare_laps(&store, a, b, &AlignConfig::default())?;
///         for delta in cmp.time_delta_ms() {
///             println!("{delta:+.0} ms");
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Stint;

impl Stint {
    /// Open (or create) a session store rooted at `path`.
    ///
    /// Existing sessions found under the root are indexed and readable
    /// immediately; sessions cut short by a crash surface their durable
    /// prefix.
    pub fn open_store(path: impl AsRef<Path>) -> Result<Arc<SessionStore>> {
        Ok(Arc::new(SessionStore::open(path.as_ref())?))
    }

    /// Bind a UDP listener on `addr` and start recording into `store`.
    ///
    /// The session is created when the first decodable datagram arrives.
    /// Use [`IngestHandle::wait_for_session`] to learn its id, and
    /// [`IngestHandle::stop`] for a clean shutdown that flushes and closes
    /// the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn record(
        addr: impl ToSocketAddrs,
        store: Arc<SessionStore>,
    ) -> Result<IngestHandle> {
        let source = UdpSource::bind(addr).await?;
        Ok(Pipeline::start(
            source,
            store,
            PipelineConfig::default(),
            RecorderConfig::default(),
        ))
    }

    /// Like [`Stint::record`] with explicit pipeline and recorder tuning.
    pub async fn record_with(
        addr: impl ToSocketAddrs,
        store: Arc<SessionStore>,
        pipeline: PipelineConfig,
        recorder: RecorderConfig,
    ) -> Result<IngestHandle> {
        let source = UdpSource::bind(addr).await?;
        Ok(Pipeline::start(source, store, pipeline, recorder))
    }
}
