//! berthgrid-executor — the agent-side half of the coordination layer.
//!
//! The executor receives task launches from the resource manager, each
//! carrying a bound-pod payload. For every task it:
//!
//! 1. posts the pod's binding to the control plane,
//! 2. hands the pod set to the local node agent over the update channel,
//! 3. reports STARTING, polls the agent until the pod runs, reports
//!    RUNNING, and
//! 4. keeps watching liveness, reporting LOST if the pod disappears.
//!
//! All outgoing status updates flow through a single-writer pump that
//! only drains while the executor is connected; transient send failures
//! re-enqueue the same update, and a driver abort stops the pump.

pub mod config;
pub mod executor;
pub mod messages;

pub use config::ExecutorConfig;
pub use executor::Executor;
