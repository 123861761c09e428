// ── Print history collection ──
//
// Lock-free storage for history entries with a sorted `watch` snapshot.
// Detail fetches are claimed per task id so the same id is never fetched
// twice concurrently.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::watch;

use crate::model::PrintHistoryEntry;

pub(crate) struct HistoryCollection {
    entries: DashMap<String, Arc<PrintHistoryEntry>>,
    /// Task ids whose detail fetch is outstanding.
    in_flight: DashSet<String>,
    /// Newest first; entries without a begin time sort last.
    snapshot: watch::Sender<Arc<Vec<Arc<PrintHistoryEntry>>>>,
}

impl HistoryCollection {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            entries: DashMap::new(),
            in_flight: DashSet::new(),
            snapshot,
        }
    }

    /// Insert bare entries for ids we have never seen. Existing entries
    /// (bare or detailed) are left alone.
    pub(crate) fn seed<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for id in ids {
            let id = id.into();
            if !self.entries.contains_key(&id) {
                self.entries
                    .insert(id.clone(), Arc::new(PrintHistoryEntry::bare(id)));
                added += 1;
            }
        }
        if added > 0 {
            self.rebuild_snapshot();
        }
        added
    }

    /// Claim the ids that still need a detail fetch. Returns only the ids
    /// this caller now owns; ids already detailed or in flight are skipped.
    pub(crate) fn claim<'a, I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        ids.into_iter()
            .filter(|id| {
                !self
                    .entries
                    .get(id.as_str())
                    .is_some_and(|e| e.has_detail)
            })
            .filter(|id| self.in_flight.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Store a detailed entry and drop its in-flight claim.
    pub(crate) fn backfill(&self, entry: PrintHistoryEntry) {
        self.in_flight.remove(&entry.task_id);
        self.entries.insert(entry.task_id.clone(), Arc::new(entry));
        self.rebuild_snapshot();
    }

    /// Drop claims after a failed fetch so a later listing can retry.
    pub(crate) fn release(&self, ids: &[String]) {
        for id in ids {
            self.in_flight.remove(id);
        }
    }

    pub(crate) fn get(&self, task_id: &str) -> Option<Arc<PrintHistoryEntry>> {
        self.entries.get(task_id).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.contains(task_id)
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<PrintHistoryEntry>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<PrintHistoryEntry>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
        self.in_flight.clear();
        self.rebuild_snapshot();
    }

    fn rebuild_snapshot(&self) {
        let mut values: Vec<Arc<PrintHistoryEntry>> =
            self.entries.iter().map(|r| Arc::clone(r.value())).collect();
        values.sort_by(|a, b| {
            b.begin_time
                .cmp(&a.begin_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn detailed(id: &str, begin: i64) -> PrintHistoryEntry {
        PrintHistoryEntry {
            begin_time: DateTime::from_timestamp(begin, 0),
            has_detail: true,
            ..PrintHistoryEntry::bare(id)
        }
    }

    #[test]
    fn seed_creates_bare_entries_once() {
        let col = HistoryCollection::new();
        assert_eq!(col.seed(["a", "b"]), 2);
        assert_eq!(col.seed(["b", "c"]), 1);
        assert!(!col.get("a").unwrap().has_detail);
        assert_eq!(col.snapshot().len(), 3);
    }

    #[test]
    fn claim_skips_in_flight_and_detailed_ids() {
        let col = HistoryCollection::new();
        col.seed(["a", "b", "c"]);
        col.backfill(detailed("c", 10));

        let ids: Vec<String> = ["a", "b", "c"].map(String::from).to_vec();
        assert_eq!(col.claim(&ids), vec!["a".to_owned(), "b".to_owned()]);
        assert!(col.claim(&ids).is_empty(), "second claim gets nothing");
        assert!(col.is_in_flight("a"));

        col.release(&["a".to_owned()]);
        assert_eq!(col.claim(&ids), vec!["a".to_owned()]);
    }

    #[test]
    fn backfill_replaces_bare_entry_and_sorts_newest_first() {
        let col = HistoryCollection::new();
        col.seed(["old", "new", "bare"]);
        let ids = vec!["old".to_owned(), "new".to_owned()];
        col.claim(&ids);
        col.backfill(detailed("old", 100));
        col.backfill(detailed("new", 200));

        assert!(!col.is_in_flight("old"));
        let order: Vec<String> = col.snapshot().iter().map(|e| e.task_id.clone()).collect();
        assert_eq!(order, vec!["new", "old", "bare"]);
    }
}
