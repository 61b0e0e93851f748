// ── Reactive printer status store ──
//
// Concurrent map keyed by printer id with push-based change notification:
// every mutation rebuilds a sorted snapshot and publishes it on a `watch`
// channel, so subscribers always see a whole, consistent collection.

mod stream;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::{PrinterState, PrinterStatus};

pub use stream::{PrinterStream, PrinterWatchStream};

pub type PrinterSnapshot = Arc<Vec<Arc<PrinterStatus>>>;

/// Status of every printer the gateway has seen.
pub struct PrinterStore {
    by_id: DashMap<String, Arc<PrinterStatus>>,
    snapshot: watch::Sender<PrinterSnapshot>,
    last_update: watch::Sender<Option<DateTime<Utc>>>,
}

impl Default for PrinterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterStore {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        let (last_update, _) = watch::channel(None);
        Self {
            by_id: DashMap::new(),
            snapshot,
            last_update,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, printer_id: &str) -> Option<Arc<PrinterStatus>> {
        self.by_id.get(printer_id).map(|r| Arc::clone(r.value()))
    }

    /// Current snapshot, sorted by printer id (cheap `Arc` clone).
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> PrinterStream {
        PrinterStream::new(self.snapshot.subscribe())
    }

    pub fn last_update(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_update.subscribe()
    }

    pub fn for_branch(&self, company_id: &str, branch_id: &str) -> Vec<Arc<PrinterStatus>> {
        self.snapshot()
            .iter()
            .filter(|p| p.company_id == company_id && p.branch_id == branch_id)
            .cloned()
            .collect()
    }

    pub fn for_company(&self, company_id: &str) -> Vec<Arc<PrinterStatus>> {
        self.snapshot()
            .iter()
            .filter(|p| p.company_id == company_id)
            .cloned()
            .collect()
    }

    pub fn count_in(&self, state: PrinterState) -> usize {
        self.by_id.iter().filter(|p| p.status == state).count()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Apply `f` to a printer, creating it under `company_id`/`branch_id`
    /// if unknown. Returns the new value, or `None` when an existing
    /// printer was left unchanged (no snapshot is published then). A newly
    /// created printer is always returned and published.
    pub fn upsert_with(
        &self,
        printer_id: &str,
        company_id: &str,
        branch_id: &str,
        f: impl FnOnce(&mut PrinterStatus),
    ) -> Option<Arc<PrinterStatus>> {
        let updated = {
            let mut created = false;
            let mut slot = self
                .by_id
                .entry(printer_id.to_owned())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(PrinterStatus::new(printer_id, company_id, branch_id))
                });
            let mut next = PrinterStatus::clone(&slot);
            f(&mut next);
            if !created && next == **slot {
                None
            } else {
                let next = Arc::new(next);
                *slot = Arc::clone(&next);
                Some(next)
            }
        };

        if updated.is_some() {
            self.publish();
        }
        updated
    }

    /// Apply `f` to a known printer. Unknown ids are left alone.
    pub fn update(
        &self,
        printer_id: &str,
        f: impl FnOnce(&mut PrinterStatus),
    ) -> Option<Arc<PrinterStatus>> {
        let updated = {
            let mut slot = self.by_id.get_mut(printer_id)?;
            let mut next = PrinterStatus::clone(&slot);
            f(&mut next);
            if next == **slot {
                None
            } else {
                let next = Arc::new(next);
                *slot = Arc::clone(&next);
                Some(next)
            }
        };

        if updated.is_some() {
            self.publish();
        }
        updated
    }

    /// Mark every printer of a branch offline. Returns those that changed.
    pub fn mark_branch_offline(&self, company_id: &str, branch_id: &str) -> Vec<Arc<PrinterStatus>> {
        let mut changed = Vec::new();
        for mut slot in self.by_id.iter_mut() {
            if slot.company_id == company_id
                && slot.branch_id == branch_id
                && slot.status != PrinterState::Offline
            {
                let mut next = PrinterStatus::clone(&slot);
                next.status = PrinterState::Offline;
                let next = Arc::new(next);
                *slot = Arc::clone(&next);
                changed.push(next);
            }
        }

        if !changed.is_empty() {
            self.publish();
        }
        changed
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn publish(&self) {
        let mut values: Vec<Arc<PrinterStatus>> =
            self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        values.sort_by(|a, b| a.id.cmp(&b.id));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
        self.last_update.send_modify(|t| *t = Some(Utc::now()));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn upsert_creates_then_updates() {
        let store = PrinterStore::new();
        let created = store
            .upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online)
            .unwrap();
        assert_eq!(created.company_id, "acme");
        assert_eq!(created.status, PrinterState::Online);

        let updated = store
            .upsert_with("p1", "ignored", "ignored", |p| p.paper_level = 40)
            .unwrap();
        assert_eq!(updated.company_id, "acme");
        assert_eq!(updated.paper_level, 40);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn bare_insert_is_published() {
        let store = PrinterStore::new();
        let created = store.upsert_with("p9", "acme", "b1", |_| {}).unwrap();
        assert_eq!(created.id, "p9");
        assert_eq!(store.snapshot().len(), 1);

        // A second no-op on the now-known printer changes nothing.
        assert!(store.upsert_with("p9", "acme", "b1", |_| {}).is_none());
    }

    #[test]
    fn unchanged_update_publishes_nothing() {
        let store = PrinterStore::new();
        store.upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online);
        let before = store.snapshot();

        assert!(store.update("p1", |p| p.status = PrinterState::Online).is_none());
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert!(store.update("ghost", |p| p.paper_level = 1).is_none());
    }

    #[test]
    fn snapshot_is_sorted() {
        let store = PrinterStore::new();
        for id in ["c", "a", "b"] {
            store.upsert_with(id, "acme", "b1", |p| p.status = PrinterState::Online);
        }
        let ids: Vec<_> = store.snapshot().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn branch_goes_offline_as_a_unit() {
        let store = PrinterStore::new();
        store.upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online);
        store.upsert_with("p2", "acme", "b1", |p| p.status = PrinterState::Busy);
        store.upsert_with("p3", "acme", "b2", |p| p.status = PrinterState::Online);

        let changed = store.mark_branch_offline("acme", "b1");
        assert_eq!(changed.len(), 2);
        assert_eq!(store.count_in(PrinterState::Offline), 2);
        assert_eq!(store.get("p3").unwrap().status, PrinterState::Online);
        assert!(store.mark_branch_offline("acme", "b1").is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = PrinterStore::new();
        let mut stream = store.subscribe();
        assert!(stream.current().is_empty());

        store.upsert_with("p1", "acme", "b1", |p| p.status = PrinterState::Online);
        let snap = stream.changed().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(stream.current().len(), 1);
    }
}
