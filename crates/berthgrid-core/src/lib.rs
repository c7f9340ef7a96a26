//! berthgrid-core — shared domain types and capability interfaces.
//!
//! Everything the scheduler and executor crates agree on lives here:
//! pod/offer/task wire types, the capability traits for the resource
//! manager driver, control plane, node agent, and container runtime,
//! and the thin REST control-plane client.

pub mod client;
pub mod traits;
pub mod types;

pub use client::RestControlPlane;
pub use traits::{
    AgentError, AgentResult, ClientError, ClientResult, ContainerRuntime, ControlPlane,
    DriverError, DriverResult, ExecutorDriver, NodeAgent, SchedulerDriver,
};
pub use types::*;
