//! A min-heap of deadlined items with a blocking pop.

use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Delayed;

struct HeapEntry<T> {
    due: Instant,
    seq: u64,
    value: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    // Reversed so the BinaryHeap max is the earliest deadline; ties pop
    // in insertion order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A deadline-ordered queue. `pop` blocks until the earliest item's
/// deadline arrives; items added with an already-elapsed deadline pop
/// immediately.
pub struct DelayQueue<T> {
    heap: Mutex<(BinaryHeap<HeapEntry<T>>, u64)>,
    notify: Notify,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new((BinaryHeap::new(), 0)),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Delayed> DelayQueue<T> {
    /// Insert an item; its deadline is read once at insertion time.
    pub fn add(&self, value: T) {
        let due = value.deadline();
        {
            let mut guard = self.heap.lock().unwrap();
            let (heap, seq) = &mut *guard;
            *seq += 1;
            heap.push(HeapEntry {
                due,
                seq: *seq,
                value,
            });
        }
        self.notify.notify_one();
    }

    /// Remove and return the earliest-due item, waiting for its
    /// deadline if necessary. Waits indefinitely on an empty queue.
    pub async fn pop(&self) -> T {
        loop {
            let next_due = {
                let mut guard = self.heap.lock().unwrap();
                let (heap, _) = &mut *guard;
                match heap.peek() {
                    None => None,
                    Some(entry) if entry.due <= Instant::now() => {
                        return heap.pop().unwrap().value;
                    }
                    Some(entry) => Some(entry.due),
                }
            };
            match next_due {
                None => self.notify.notified().await,
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Item {
        name: &'static str,
        due: Instant,
    }

    impl Delayed for Item {
        fn deadline(&self) -> Instant {
            self.due
        }
    }

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn pops_in_deadline_order() {
        let q = DelayQueue::new();
        q.add(Item {
            name: "late",
            due: in_ms(40),
        });
        q.add(Item {
            name: "early",
            due: in_ms(5),
        });
        assert_eq!(q.pop().await.name, "early");
        assert_eq!(q.pop().await.name, "late");
    }

    #[tokio::test]
    async fn elapsed_deadline_pops_immediately() {
        let q = DelayQueue::new();
        q.add(Item {
            name: "due",
            due: Instant::now(),
        });
        let popped = tokio::time::timeout(Duration::from_millis(50), q.pop())
            .await
            .expect("pop should not block");
        assert_eq!(popped.name, "due");
    }

    #[tokio::test]
    async fn pop_blocks_until_deadline() {
        let q = DelayQueue::new();
        let start = Instant::now();
        q.add(Item {
            name: "later",
            due: in_ms(30),
        });
        q.pop().await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn add_wakes_a_waiting_pop() {
        let q = std::sync::Arc::new(DelayQueue::<Item>::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await.name });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add(Item {
            name: "arrived",
            due: Instant::now(),
        });
        assert_eq!(waiter.await.unwrap(), "arrived");
    }

    #[tokio::test]
    async fn equal_deadlines_pop_in_insertion_order() {
        let q = DelayQueue::new();
        let due = Instant::now();
        q.add(Item { name: "first", due });
        q.add(Item { name: "second", due });
        assert_eq!(q.pop().await.name, "first");
        assert_eq!(q.pop().await.name, "second");
    }
}
