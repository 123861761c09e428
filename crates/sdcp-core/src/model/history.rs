// ── Print history ──

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A finished or aborted print job.
///
/// Created bare (id only) from a history listing and backfilled once the
/// detail fetch for that id returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintHistoryEntry {
    pub task_id: String,
    pub filename: Option<String>,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Raw board status code of the finished task.
    pub status: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub layers_printed: Option<u32>,
    pub time_lapse_url: Option<String>,
    /// Slicer metadata as the board reports it.
    pub slice_info: Option<Value>,
    pub has_detail: bool,
}

impl PrintHistoryEntry {
    pub fn bare(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            filename: None,
            begin_time: None,
            end_time: None,
            status: None,
            thumbnail_url: None,
            layers_printed: None,
            time_lapse_url: None,
            slice_info: None,
            has_detail: false,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_time? - self.begin_time?)
    }
}
