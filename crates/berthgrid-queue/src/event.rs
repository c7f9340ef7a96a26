//! Per-key event tags.
//!
//! Every state-changing queue operation records a tag for the affected
//! key. Consumers use [`EventHistory::poll`] to debounce decisions made
//! against stale snapshots: the scheduler checks that a pod it popped is
//! still a plain pop (not superseded by a delete), and the deleter keys
//! off delete tags.

use std::collections::HashMap;

/// The kind of the most recent event recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    Added,
    Updated,
    Deleted,
    Popped,
}

/// Latest-event-per-key bookkeeping.
#[derive(Debug, Default)]
pub struct EventHistory {
    latest: HashMap<String, EventTag>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `tag` as the latest event for `key`, superseding any
    /// unconsumed earlier tag.
    pub fn record(&mut self, key: &str, tag: EventTag) {
        self.latest.insert(key.to_string(), tag);
    }

    /// Whether the latest event for `key` is `tag`. The tag stays in
    /// place until a newer event supersedes it, so a requeued item can
    /// be polled against the same pop again.
    pub fn poll(&self, key: &str, tag: EventTag) -> bool {
        self.latest.get(key) == Some(&tag)
    }

    /// Drop all history for `key`.
    pub fn forget(&mut self, key: &str) {
        self.latest.remove(key);
    }
}
