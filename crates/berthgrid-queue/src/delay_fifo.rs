//! Unique-key deadline queue with insert policies and breakout signals.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::{Delayed, EventHistory, EventTag, InsertPolicy, Keyed};

struct Slot<T> {
    value: T,
    seq: u64,
    due: Instant,
}

struct HeapKey {
    due: Instant,
    seq: u64,
    key: String,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    // Reversed: earliest deadline at the top, ties in insertion order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    items: HashMap<String, Slot<T>>,
    heap: BinaryHeap<HeapKey>,
    history: EventHistory,
    seq: u64,
}

/// A keyed delay queue. At most one entry per key; pops come out in
/// deadline order, or earlier when an item's breakout signal fires.
pub struct DelayFifo<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for DelayFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayFifo<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                heap: BinaryHeap::new(),
                history: EventHistory::new(),
                seq: 0,
            }),
            notify: Notify::new(),
        }
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

impl<T: Keyed + Delayed> DelayFifo<T> {
    /// Insert under `policy`, returning whether the item was accepted.
    /// With [`InsertPolicy::KeepExisting`], an existing entry under the
    /// same key is left untouched and `false` is returned.
    pub fn offer(&self, value: T, policy: InsertPolicy) -> bool {
        let key = value.key();
        let due = value.deadline();
        let accepted = {
            let mut inner = self.inner.lock().unwrap();
            let exists = inner.items.contains_key(&key);
            if exists && policy == InsertPolicy::KeepExisting {
                false
            } else {
                inner.seq += 1;
                let seq = inner.seq;
                inner.items.insert(key.clone(), Slot { value, seq, due });
                inner.heap.push(HeapKey {
                    due,
                    seq,
                    key: key.clone(),
                });
                let tag = if exists {
                    EventTag::Updated
                } else {
                    EventTag::Added
                };
                inner.history.record(&key, tag);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Like [`offer`](Self::offer), but a refused replacement is not an
    /// error worth reporting to the caller.
    pub fn add(&self, value: T, policy: InsertPolicy) {
        let _ = self.offer(value, policy);
    }

    /// Remove the entry stored under `key`, if any.
    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.items.remove(key).is_some();
            if removed {
                inner.history.record(key, EventTag::Deleted);
            }
            removed
        };
        if removed {
            self.notify.notify_one();
        }
        removed
    }

    /// Pop the earliest-due (or broken-out) item, waiting up to
    /// `timeout`. Returns `None` if nothing came due in time.
    pub async fn await_pop(&self, timeout: Duration) -> Option<T> {
        let limit = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            let (next_due, breakers) = self.wait_state();
            let sleep_to = next_due.map_or(limit, |due| due.min(limit));
            tokio::select! {
                _ = tokio::time::sleep_until(sleep_to) => {}
                _ = self.notify.notified() => {}
                _ = breakout_any(breakers) => {}
            }
            if Instant::now() >= limit {
                return self.try_pop();
            }
        }
    }

    /// Pop the earliest-due (or broken-out) item, waiting indefinitely.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            let (next_due, breakers) = self.wait_state();
            match next_due {
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = breakout_any(breakers) => {}
                    }
                }
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.notify.notified() => {}
                        _ = breakout_any(breakers) => {}
                    }
                }
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        // Breakout signals trump deadlines.
        let fired = inner
            .items
            .iter()
            .find(|(_, slot)| breakout_fired(&slot.value))
            .map(|(key, _)| key.clone());
        if let Some(key) = fired {
            let slot = inner.items.remove(&key).unwrap();
            inner.history.record(&key, EventTag::Popped);
            return Some(slot.value);
        }

        // Otherwise the heap head decides, skipping stale entries left
        // behind by replacements and deletes.
        let now = Instant::now();
        while let Some(head) = inner.heap.peek() {
            let stale = inner
                .items
                .get(&head.key)
                .map_or(true, |slot| slot.seq != head.seq);
            if stale {
                inner.heap.pop();
                continue;
            }
            if head.due <= now {
                let key = inner.heap.pop().unwrap().key;
                let slot = inner.items.remove(&key).unwrap();
                inner.history.record(&key, EventTag::Popped);
                return Some(slot.value);
            }
            break;
        }
        None
    }

    fn wait_state(&self) -> (Option<Instant>, Vec<watch::Receiver<bool>>) {
        let mut inner = self.inner.lock().unwrap();

        // Skim stale heap heads so the reported deadline is real.
        loop {
            let stale = match inner.heap.peek() {
                Some(head) => inner
                    .items
                    .get(&head.key)
                    .map_or(true, |slot| slot.seq != head.seq),
                None => break,
            };
            if stale {
                inner.heap.pop();
            } else {
                break;
            }
        }

        let next_due = inner.heap.peek().map(|head| head.due);
        let breakers = inner
            .items
            .values()
            .filter_map(|slot| slot.value.breakout())
            .collect();
        (next_due, breakers)
    }
}

impl<T: Clone> DelayFifo<T> {
    /// Snapshot of the stored values, in no particular order.
    pub fn list(&self) -> Vec<T> {
        self.inner
            .lock()
            .unwrap()
            .items
            .values()
            .map(|slot| slot.value.clone())
            .collect()
    }
}

fn breakout_fired<T: Delayed>(value: &T) -> bool {
    value.breakout().is_some_and(|rx| *rx.borrow())
}

/// Resolve when any receiver observes `true`. Closed senders that never
/// sent `true` do not resolve.
async fn breakout_any(breakers: Vec<watch::Receiver<bool>>) {
    if breakers.is_empty() {
        std::future::pending::<()>().await;
    }
    let futures = breakers
        .into_iter()
        .map(|mut rx| {
            Box::pin(async move {
                loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    select_all(futures).await;
}
