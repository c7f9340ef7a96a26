//! berthgrid-scheduler — pod scheduling over perishable resource offers.
//!
//! The framework-side half of the coordination layer. Pods stream in
//! from the control plane, offers stream in from the resource manager,
//! and the scheduler matches the two:
//!
//! ```text
//! pod updates ──► Queuer ──► yield ──► schedule ──► bind ──► driver.launch_tasks
//!                   ▲                     │            │
//!                   │   requeue+backoff   │            │
//!                   └── ErrorHandler ◄────┴────────────┘
//!                              │
//!                              └── offer-arrival breakout (OfferRegistry.listen)
//! ```
//!
//! One coarse lock guards the pod-task bimap and the agent table; the
//! offer registry and queues carry their own synchronization. All
//! cross-cutting operations (schedule, bind, delete, error handling)
//! take the scheduler lock first.

pub mod binder;
pub mod debug;
pub mod deleter;
pub mod error;
pub mod error_handler;
pub mod placement;
pub mod queuer;
pub mod reconcile;
pub mod scheduler;

pub use debug::debug_router;
pub use error::{SchedulerError, SchedulerResult};
pub use error_handler::PodBackoff;
pub use placement::{FirstFit, Placement};
pub use queuer::{
    QueuedPod, Queuer, ENQUEUE_POP_TIMEOUT, ENQUEUE_WAIT_TIMEOUT, YIELD_POP_TIMEOUT,
    YIELD_WAIT_TIMEOUT,
};
pub use scheduler::{SchedCore, Scheduler, SchedulerConfig};
