//! Insertion-ordered store with event tags and a mirror channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::{EventHistory, EventTag, Keyed};

/// A queue event replayed on the mirror channel.
#[derive(Debug, Clone)]
pub struct QueueEntry<T> {
    pub value: T,
    pub tag: EventTag,
}

struct Inner<T> {
    items: HashMap<String, T>,
    pending: VecDeque<String>,
    history: EventHistory,
}

/// A store fed by the control plane's object stream.
///
/// Unlike [`crate::DelayFifo`], popped items stay resident so the store
/// keeps reflecting the upstream collection; popping only consumes the
/// pending-work marker. Every add/update/delete/pop is also replayed on
/// the mirror channel, if one is attached.
pub struct EventFifo<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    mirror: Option<mpsc::UnboundedSender<QueueEntry<T>>>,
}

impl<T> Default for EventFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventFifo<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                pending: VecDeque::new(),
                history: EventHistory::new(),
            }),
            notify: Notify::new(),
            mirror: None,
        }
    }

    /// Attach a mirror channel replaying every event.
    pub fn with_mirror(mut self, tx: mpsc::UnboundedSender<QueueEntry<T>>) -> Self {
        self.mirror = Some(tx);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the latest event tag for `key` if it matches.
    pub fn poll(&self, key: &str, tag: EventTag) -> bool {
        self.inner.lock().unwrap().history.poll(key, tag)
    }
}

impl<T: Keyed + Clone> EventFifo<T> {
    pub fn add(&self, value: T) {
        self.ingest(value, EventTag::Added);
    }

    pub fn update(&self, value: T) {
        self.ingest(value, EventTag::Updated);
    }

    fn ingest(&self, value: T, tag: EventTag) {
        let key = value.key();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.items.insert(key.clone(), value.clone());
            if !inner.pending.contains(&key) {
                inner.pending.push_back(key.clone());
            }
            inner.history.record(&key, tag);
        }
        self.emit(value, tag);
        self.notify.notify_one();
    }

    /// Remove the object; the passed value is what gets replayed on the
    /// mirror (the upstream delete notification carries the final state).
    pub fn delete(&self, value: T) {
        let key = value.key();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.items.remove(&key);
            inner.history.record(&key, EventTag::Deleted);
        }
        self.emit(value, EventTag::Deleted);
        self.notify.notify_one();
    }

    /// Replace the whole store, as on a watch resync.
    pub fn replace(&self, values: Vec<T>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.items.clear();
            inner.pending.clear();
            for value in &values {
                let key = value.key();
                inner.items.insert(key.clone(), value.clone());
                inner.pending.push_back(key.clone());
                inner.history.record(&key, EventTag::Added);
            }
        }
        for value in values {
            self.emit(value, EventTag::Added);
        }
        self.notify.notify_one();
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.lock().unwrap().items.get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.inner.lock().unwrap().items.values().cloned().collect()
    }

    /// Pop the next pending object in insertion order, waiting up to
    /// `timeout`. Keys deleted while pending are skipped.
    pub async fn await_pop(&self, timeout: Duration) -> Option<T> {
        let limit = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(limit) => return self.try_pop(),
                _ = self.notify.notified() => {}
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let popped = {
            let mut inner = self.inner.lock().unwrap();
            loop {
                let key = inner.pending.pop_front()?;
                if let Some(value) = inner.items.get(&key).cloned() {
                    inner.history.record(&key, EventTag::Popped);
                    break Some(value);
                }
            }
        };
        if let Some(value) = &popped {
            self.emit(value.clone(), EventTag::Popped);
        }
        popped
    }

    fn emit(&self, value: T, tag: EventTag) {
        if let Some(tx) = &self.mirror {
            let _ = tx.send(QueueEntry { value, tag });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        key: &'static str,
        rev: u32,
    }

    impl Keyed for Obj {
        fn key(&self) -> String {
            self.key.to_string()
        }
    }

    #[tokio::test]
    async fn pop_returns_in_insertion_order() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.add(Obj { key: "b", rev: 1 });
        assert_eq!(q.await_pop(Duration::from_millis(10)).await.unwrap().key, "a");
        assert_eq!(q.await_pop(Duration::from_millis(10)).await.unwrap().key, "b");
        assert!(q.await_pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn update_while_pending_does_not_duplicate() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.update(Obj { key: "a", rev: 2 });
        let popped = q.await_pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped.rev, 2);
        assert!(q.await_pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn popped_items_stay_resident() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.await_pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(q.get("a"), Some(Obj { key: "a", rev: 1 }));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn deleted_while_pending_is_skipped() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.add(Obj { key: "b", rev: 1 });
        q.delete(Obj { key: "a", rev: 1 });
        assert_eq!(q.await_pop(Duration::from_millis(10)).await.unwrap().key, "b");
        assert!(q.get("a").is_none());
    }

    #[tokio::test]
    async fn poll_tracks_latest_event() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.await_pop(Duration::from_millis(10)).await.unwrap();
        assert!(q.poll("a", EventTag::Popped));

        q.delete(Obj { key: "a", rev: 1 });
        assert!(!q.poll("a", EventTag::Popped));
        assert!(q.poll("a", EventTag::Deleted));
    }

    #[tokio::test]
    async fn mirror_replays_all_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let q = EventFifo::new().with_mirror(tx);
        q.add(Obj { key: "a", rev: 1 });
        q.await_pop(Duration::from_millis(10)).await.unwrap();
        q.delete(Obj { key: "a", rev: 1 });

        assert_eq!(rx.recv().await.unwrap().tag, EventTag::Added);
        assert_eq!(rx.recv().await.unwrap().tag, EventTag::Popped);
        let deleted = rx.recv().await.unwrap();
        assert_eq!(deleted.tag, EventTag::Deleted);
        assert_eq!(deleted.value.key, "a");
    }

    #[tokio::test]
    async fn replace_resyncs_store_and_pending() {
        let q = EventFifo::new();
        q.add(Obj { key: "a", rev: 1 });
        q.replace(vec![Obj { key: "b", rev: 1 }, Obj { key: "c", rev: 1 }]);
        assert!(q.get("a").is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q.await_pop(Duration::from_millis(10)).await.unwrap().key, "b");
        assert_eq!(q.await_pop(Duration::from_millis(10)).await.unwrap().key, "c");
    }

    #[tokio::test]
    async fn await_pop_wakes_on_add() {
        let q = std::sync::Arc::new(EventFifo::new());
        let q2 = q.clone();
        let waiter =
            tokio::spawn(async move { q2.await_pop(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add(Obj { key: "a", rev: 1 });
        let popped = waiter.await.unwrap();
        assert_eq!(popped.unwrap().key, "a");
    }
}
