// ── Reactive printer state ──
//
// Everything the background bridge learns about one printer lands here.
// Readers get cheap `Arc` snapshots or subscribe to `watch` channels.

mod history;

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::model::{Attributes, PrintHistoryEntry, StatusSnapshot};

pub(crate) use history::HistoryCollection;

pub struct PrinterStore {
    status: watch::Sender<Option<Arc<StatusSnapshot>>>,
    attributes: watch::Sender<Option<Arc<Attributes>>>,
    pub(crate) history: HistoryCollection,
    video_url: ArcSwapOption<String>,
    last_update: watch::Sender<Option<DateTime<Utc>>>,
}

impl Default for PrinterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PrinterStore {
    pub fn new() -> Self {
        let (status, _) = watch::channel(None);
        let (attributes, _) = watch::channel(None);
        let (last_update, _) = watch::channel(None);
        Self {
            status,
            attributes,
            history: HistoryCollection::new(),
            video_url: ArcSwapOption::empty(),
            last_update,
        }
    }

    // ── Writers ──────────────────────────────────────────────────────

    pub(crate) fn set_status(&self, snapshot: StatusSnapshot) {
        let stamp = snapshot.updated_at;
        self.status.send_replace(Some(Arc::new(snapshot)));
        self.touch(stamp);
    }

    pub(crate) fn set_attributes(&self, attributes: Attributes) {
        self.attributes.send_replace(Some(Arc::new(attributes)));
        self.touch(Utc::now());
    }

    pub(crate) fn set_video_url(&self, url: Option<String>) {
        self.video_url.store(url.map(Arc::new));
    }

    /// Forget everything; used when a new session starts.
    pub(crate) fn reset(&self) {
        self.status.send_replace(None);
        self.attributes.send_replace(None);
        self.history.clear();
        self.video_url.store(None);
    }

    fn touch(&self, at: DateTime<Utc>) {
        self.last_update.send_replace(Some(at));
    }

    // ── Readers ──────────────────────────────────────────────────────

    pub fn status(&self) -> Option<Arc<StatusSnapshot>> {
        self.status.borrow().clone()
    }

    pub fn attributes(&self) -> Option<Arc<Attributes>> {
        self.attributes.borrow().clone()
    }

    pub fn history(&self) -> Arc<Vec<Arc<PrintHistoryEntry>>> {
        self.history.snapshot()
    }

    pub fn history_entry(&self, task_id: &str) -> Option<Arc<PrintHistoryEntry>> {
        self.history.get(task_id)
    }

    pub fn video_url(&self) -> Option<Arc<String>> {
        self.video_url.load_full()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.status.subscribe()
    }

    pub fn subscribe_attributes(&self) -> watch::Receiver<Option<Arc<Attributes>>> {
        self.attributes.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<Arc<Vec<Arc<PrintHistoryEntry>>>> {
        self.history.subscribe()
    }
}
