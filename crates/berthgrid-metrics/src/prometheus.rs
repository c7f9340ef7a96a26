//! Prometheus text exposition format.

use crate::{OfferMetrics, SchedulerMetrics};

/// Render the scheduler summaries and offer counters into the
/// Prometheus text exposition format.
pub fn render_prometheus(scheduler: &SchedulerMetrics, offers: &OfferMetrics) -> String {
    let mut out = String::new();
    scheduler.queue_wait.render_into(&mut out);
    scheduler.bind_latency.render_into(&mut out);
    offers.received.render_into(&mut out);
    offers.declined.render_into(&mut out);
    offers.acquired.render_into(&mut out);
    offers.released.render_into(&mut out);
    out
}
