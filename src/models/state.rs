use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{ItemMeta, JobStatus, RunOptions, RunStats};

/// What the queue walker should do after a completion has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Schedule the next iteration after the standard inter-item delay.
    Continue,
    /// Periodic pause: hold for the duration, then resume at the cursor.
    Pause { duration_secs: u64 },
}

/// Result of reconciling a completion signal against the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied(NextAction),
    /// The signaled item was already terminal; nothing changed.
    DuplicateDropped,
    /// The signaled index does not exist in the queue.
    UnknownIndex,
}

/// Process-wide job state. Serialized as a single blob (see `StateStore`) so
/// a restart resumes with the previous queue and counters.
///
/// Invariants maintained by the methods below: the cursor only moves forward,
/// at most one item is in flight, and a terminal item is counted in exactly
/// one of {completed, failed}.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    pub items: Vec<ItemMeta>,
    pub cursor: usize,
    pub processing: bool,
    pub paused: bool,
    pub stats: RunStats,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub item_started_at: Option<DateTime<Utc>>,
    pub stuck: bool,
    pub stuck_since: Option<DateTime<Utc>>,
    pub pause_until: Option<DateTime<Utc>>,
    /// Result URLs already downloaded, so a video is never fetched twice.
    pub downloaded_urls: HashSet<String>,
}

impl JobState {
    pub fn touch(&mut self) {
        self.last_update = Some(Utc::now());
    }

    /// Rebuild the in-memory record from a persisted snapshot. A run that was
    /// in flight when the process died is not resumed automatically, so the
    /// processing flag and in-flight markers are cleared and any item caught
    /// mid-processing is demoted back to pending.
    pub fn restore(saved: JobState) -> Self {
        let mut state = saved;
        state.processing = false;
        state.stuck = false;
        state.stuck_since = None;
        state.item_started_at = None;
        for item in &mut state.items {
            if item.status == JobStatus::Processing {
                item.status = JobStatus::Pending;
            }
        }
        state
    }

    pub fn push_item(&mut self, id: Uuid, name: impl Into<String>) {
        self.items.push(ItemMeta::new(id, name));
        self.touch();
    }

    /// Remove one item by id. Returns false when the id is unknown.
    pub fn remove_item(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        let removed = self.items.len() != before;
        if removed {
            self.cursor = self.cursor.min(self.items.len());
            self.touch();
        }
        removed
    }

    /// Drop everything and reset to a fresh record.
    pub fn clear(&mut self) {
        *self = JobState::default();
        self.touch();
    }

    /// Start a run from the top of the queue. Statuses from a previous run
    /// are reset so every item is dispatched again.
    pub fn begin_run(&mut self) {
        self.processing = true;
        self.paused = false;
        self.cursor = 0;
        self.stats = RunStats::default();
        self.started_at = Some(Utc::now());
        self.item_started_at = None;
        self.stuck = false;
        self.stuck_since = None;
        self.pause_until = None;
        for item in &mut self.items {
            item.status = JobStatus::Pending;
        }
        self.touch();
    }

    /// The run is over: every index before the cursor is terminal.
    pub fn finish_run(&mut self) {
        self.processing = false;
        self.item_started_at = None;
        self.touch();
    }

    /// User cancel: stop the walk and drop in-flight bookkeeping.
    pub fn cancel(&mut self) {
        self.processing = false;
        self.paused = false;
        self.pause_until = None;
        self.item_started_at = None;
        self.stuck = false;
        self.stuck_since = None;
        self.touch();
    }

    pub fn toggle_pause(&mut self) -> bool {
        self.paused = !self.paused;
        if !self.paused {
            self.pause_until = None;
        }
        self.touch();
        self.paused
    }

    /// An item is being handed to the page driver.
    pub fn mark_dispatched(&mut self, index: usize) {
        if let Some(item) = self.items.get_mut(index) {
            item.status = JobStatus::Processing;
        }
        self.item_started_at = Some(Utc::now());
        self.stuck = false;
        self.stuck_since = None;
        self.touch();
    }

    /// The watchdog fired for the in-flight item.
    pub fn mark_stuck(&mut self) {
        self.stuck = true;
        self.stuck_since = self.item_started_at.or_else(|| Some(Utc::now()));
        self.touch();
    }

    /// Begin a periodic pause lasting `duration_secs`.
    pub fn begin_pause(&mut self, duration_secs: u64) {
        self.paused = true;
        self.pause_until = Some(Utc::now() + chrono::Duration::seconds(duration_secs as i64));
        self.touch();
    }

    /// The periodic pause elapsed (or was lifted early).
    pub fn end_pause(&mut self) {
        self.paused = false;
        self.pause_until = None;
        self.touch();
    }

    /// Apply a completion signal. The signaled index wins for status and
    /// counters; the cursor advances to `max(cursor, index + 1)` and never
    /// moves backward. Signals for terminal items are dropped.
    pub fn apply_completion(
        &mut self,
        signaled: Option<usize>,
        success: bool,
        options: &RunOptions,
    ) -> Completion {
        let index = signaled.unwrap_or(self.cursor);

        let Some(item) = self.items.get_mut(index) else {
            return Completion::UnknownIndex;
        };
        if item.status.is_terminal() {
            return Completion::DuplicateDropped;
        }

        if success {
            item.status = JobStatus::Completed;
            self.stats.completed += 1;
        } else {
            item.status = JobStatus::Failed;
            self.stats.failed += 1;
        }

        if index >= self.cursor {
            self.cursor = index + 1;
        }

        self.item_started_at = None;
        self.stuck = false;
        self.stuck_since = None;
        self.touch();

        let pause_due = success
            && options.pause_every > 0
            && self.stats.completed > 0
            && self.stats.completed % options.pause_every == 0;

        if pause_due {
            Completion::Applied(NextAction::Pause {
                duration_secs: options.pause_duration_secs,
            })
        } else {
            Completion::Applied(NextAction::Continue)
        }
    }

    /// Record a downloaded result URL. Returns false when it was already
    /// recorded, in which case the caller must not download it again.
    pub fn record_download(&mut self, url: &str) -> bool {
        let newly = self.downloaded_urls.insert(url.to_string());
        if newly {
            self.touch();
        }
        newly
    }

    /// Plain-text completion report: one header line, then one
    /// `index;name;status` line per item (1-based index).
    pub fn completion_report(&self) -> String {
        let mut lines = Vec::with_capacity(self.items.len() + 1);
        lines.push("Index;Name;Status".to_string());
        for (i, item) in self.items.iter().enumerate() {
            lines.push(format!("{};{};{}", i + 1, item.name, item.status));
        }
        lines.join("\n")
    }
}
