// ── Printer snapshot subscriptions ──

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::PrinterSnapshot;

/// A subscription to the printer collection.
///
/// Holds the snapshot seen at creation (or at the last `changed()`), and
/// can wait for the next one or be turned into a `Stream`.
pub struct PrinterStream {
    current: PrinterSnapshot,
    receiver: watch::Receiver<PrinterSnapshot>,
}

impl PrinterStream {
    pub(crate) fn new(receiver: watch::Receiver<PrinterSnapshot>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    pub fn current(&self) -> &PrinterSnapshot {
        &self.current
    }

    /// Latest snapshot, which may be newer than [`current`](Self::current).
    pub fn latest(&self) -> PrinterSnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. `None` once the store is dropped.
    pub async fn changed(&mut self) -> Option<PrinterSnapshot> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    pub fn into_stream(self) -> PrinterWatchStream {
        PrinterWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` of printer snapshots, one per store mutation (coalesced).
pub struct PrinterWatchStream {
    inner: WatchStream<PrinterSnapshot>,
}

impl Stream for PrinterWatchStream {
    type Item = PrinterSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;

    use crate::model::PrinterState;
    use crate::store::PrinterStore;

    #[tokio::test]
    async fn stream_yields_initial_then_updated_snapshot() {
        let store = PrinterStore::new();
        let mut stream = store.subscribe().into_stream();

        let first = stream.next().await.unwrap();
        assert!(first.is_empty());

        store.upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online);
        let second = stream.next().await.unwrap();
        assert_eq!(second.len(), 1);
    }
}
