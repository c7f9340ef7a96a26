//! berthgrid-queue — deadline-ordered queues and event-tagged FIFOs.
//!
//! Three building blocks:
//!
//! - [`DelayQueue`] — a min-heap keyed by deadline whose `pop` blocks
//!   until the earliest item comes due. Drives offer aging.
//! - [`DelayFifo`] — unique-key semantics layered over a deadline heap,
//!   with insert policies, event tags, and per-item breakout signals
//!   that release an item ahead of its deadline. Holds the pods waiting
//!   to be scheduled and the offer listeners.
//! - [`EventFifo`] — an insertion-ordered store with per-key event tags
//!   and an optional mirror channel replaying every event. Holds the
//!   control plane's pod updates.
//!
//! All queues are internally synchronized. Wakeups use permit semantics
//! (`Notify::notify_one`), which assumes a single consumer per queue;
//! every queue here is drained by exactly one background loop.

mod delay_fifo;
mod delay_queue;
mod event;
mod fifo;

pub use delay_fifo::DelayFifo;
pub use delay_queue::DelayQueue;
pub use event::{EventHistory, EventTag};
pub use fifo::{EventFifo, QueueEntry};

use tokio::sync::watch;
use tokio::time::Instant;

/// Items addressable by a unique string key.
pub trait Keyed {
    fn key(&self) -> String;
}

/// Pods in the update store are keyed by `namespace/name`, matching how
/// the control plane indexes them. (Queues of pods awaiting scheduling
/// key their envelopes by uid instead.)
impl Keyed for berthgrid_core::Pod {
    fn key(&self) -> String {
        berthgrid_core::Pod::key(self)
    }
}

/// Items carrying a deadline and, optionally, a breakout signal that
/// makes them poppable before the deadline arrives.
pub trait Delayed {
    fn deadline(&self) -> Instant;

    /// A watch whose value turning `true` releases the item early.
    /// Senders that drop without ever sending `true` never release.
    fn breakout(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// Insert policy for keyed queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPolicy {
    /// Overwrite any existing entry under the same key.
    ReplaceExisting,
    /// Leave an existing entry untouched.
    KeepExisting,
}
