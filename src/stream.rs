//! Live sample streaming for "follow" views.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;

use crate::types::TelemetrySample;

pin_project! {
    /// Stream of samples appended to a live session.
    ///
    /// Backed by the session's broadcast ring. A subscriber that cannot
    /// keep up with the source rate skips the overwritten samples and
    /// continues from the newest available one; the skip count is
    /// queryable. Display consumers want freshness, and the durable record
    /// remains complete in the store regardless.
    pub struct SampleStream {
        #[pin]
        inner: BroadcastStream<Arc<TelemetrySample>>,
        skipped: u64,
    }
}

impl SampleStream {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<TelemetrySample>>) -> Self {
        Self { inner: BroadcastStream::new(rx), skipped: 0 }
    }

    /// Samples this subscriber missed by falling behind the broadcast ring.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Stream for SampleStream {
    type Item = Arc<TelemetrySample>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(sample)) => return Poll::Ready(Some(sample)),
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    *this.skipped += n;
                    debug!("Live subscriber lagged, skipped {n} samples");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
