// ── Reactive status stream ──
//
// Subscription handle over a printer's live status.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::StatusSnapshot;

type Slot = Option<Arc<StatusSnapshot>>;

/// Point-in-time access plus change notification for one printer's status.
pub struct StatusStream {
    current: Slot,
    receiver: watch::Receiver<Slot>,
}

impl StatusStream {
    pub(crate) fn new(mut receiver: watch::Receiver<Slot>) -> Self {
        let current = receiver.borrow_and_update().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation or at the last `changed()`.
    pub fn current(&self) -> Option<&Arc<StatusSnapshot>> {
        self.current.as_ref()
    }

    pub fn latest(&self) -> Slot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next non-empty snapshot. `None` once the printer is gone.
    pub async fn changed(&mut self) -> Option<Arc<StatusSnapshot>> {
        loop {
            self.receiver.changed().await.ok()?;
            let snap = self.receiver.borrow_and_update().clone();
            self.current.clone_from(&snap);
            if snap.is_some() {
                return snap;
            }
        }
    }

    pub fn into_stream(self) -> StatusWatchStream {
        StatusWatchStream {
            inner: WatchStream::from_changes(self.receiver),
        }
    }
}

/// `Stream` adapter yielding each new status snapshot.
pub struct StatusWatchStream {
    inner: WatchStream<Slot>,
}

impl Stream for StatusWatchStream {
    type Item = Arc<StatusSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Some(snap))) => return Poll::Ready(Some(snap)),
                // A reset between sessions; keep waiting for real data.
                Poll::Ready(Some(None)) => {}
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_skips_resets_and_yields_snapshots() {
        let (tx, rx) = watch::channel::<Slot>(None);
        let mut stream = StatusStream::new(rx).into_stream();

        tx.send_replace(None);
        tx.send_replace(Some(Arc::new(StatusSnapshot::default())));
        let snap = stream.next().await.unwrap();
        assert_eq!(snap.print.percent_complete, 0.0);
    }

    #[tokio::test]
    async fn changed_returns_none_when_sender_drops() {
        let (tx, rx) = watch::channel::<Slot>(None);
        let mut stream = StatusStream::new(rx);
        assert!(stream.current().is_none());
        drop(tx);
        assert!(stream.changed().await.is_none());
    }
}
