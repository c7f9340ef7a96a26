//! berthgrid-metrics — scheduler latency summaries and offer counters.
//!
//! Metrics are construction-time dependencies: the scheduler and offer
//! registry each receive an `Arc` handle at build time and write through
//! it. Nothing registers into process-global state.

pub mod collector;
pub mod prometheus;

pub use collector::{HostCounter, OfferMetrics, SchedulerMetrics, Summary};
pub use prometheus::render_prometheus;
