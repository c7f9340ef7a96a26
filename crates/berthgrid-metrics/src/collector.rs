//! In-process metric primitives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Most recent samples kept per summary for quantile estimation.
const SUMMARY_WINDOW: usize = 1024;

/// A latency summary: running count/sum plus a sliding sample window.
pub struct Summary {
    name: &'static str,
    help: &'static str,
    count: AtomicU64,
    sum_us: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl Summary {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(SUMMARY_WINDOW)),
        }
    }

    /// Record one observation.
    pub fn observe(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == SUMMARY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(us);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    /// Quantile over the sample window, in microseconds.
    pub fn quantile(&self, q: f64) -> f64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
        sorted[idx] as f64
    }

    pub(crate) fn render_into(&self, out: &mut String) {
        out.push_str(&format!("# HELP {} {}\n", self.name, self.help));
        out.push_str(&format!("# TYPE {} summary\n", self.name));
        for q in [0.5, 0.9, 0.99] {
            out.push_str(&format!(
                "{}{{quantile=\"{}\"}} {:.1}\n",
                self.name,
                q,
                self.quantile(q)
            ));
        }
        out.push_str(&format!("{}_sum {}\n", self.name, self.sum_us()));
        out.push_str(&format!("{}_count {}\n", self.name, self.count()));
    }
}

/// A counter labelled by agent host.
#[derive(Debug)]
pub struct HostCounter {
    name: &'static str,
    help: &'static str,
    counts: Mutex<HashMap<String, u64>>,
}

impl HostCounter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn inc(&self, host: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(host.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, host: &str) -> u64 {
        self.counts.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.lock().unwrap().values().sum()
    }

    pub(crate) fn render_into(&self, out: &mut String) {
        out.push_str(&format!("# HELP {} {}\n", self.name, self.help));
        out.push_str(&format!("# TYPE {} counter\n", self.name));
        let counts = self.counts.lock().unwrap();
        let mut hosts: Vec<_> = counts.keys().collect();
        hosts.sort();
        for host in hosts {
            out.push_str(&format!(
                "{}{{host=\"{}\"}} {}\n",
                self.name, host, counts[host]
            ));
        }
    }
}

/// The two scheduler-side latency summaries.
pub struct SchedulerMetrics {
    /// Time from a pod entering the scheduling queue to being yielded.
    pub queue_wait: Summary,
    /// Time from offer acceptance to the launch call returning.
    pub bind_latency: Summary,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            queue_wait: Summary::new(
                "scheduler_queue_wait_time_microseconds",
                "Launch queue wait time in microseconds",
            ),
            bind_latency: Summary::new(
                "scheduler_bind_latency_microseconds",
                "Latency in microseconds between offer acceptance and task launch",
            ),
        }
    }
}

/// Per-host offer lifecycle counters.
#[derive(Debug)]
pub struct OfferMetrics {
    pub received: HostCounter,
    pub declined: HostCounter,
    pub acquired: HostCounter,
    pub released: HostCounter,
}

impl Default for OfferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferMetrics {
    pub fn new() -> Self {
        Self {
            received: HostCounter::new(
                "scheduler_offers_received_total",
                "Offers received from the resource manager",
            ),
            declined: HostCounter::new(
                "scheduler_offers_declined_total",
                "Offers declined back to the resource manager",
            ),
            acquired: HostCounter::new(
                "scheduler_offers_acquired_total",
                "Offers claimed by a scheduling attempt",
            ),
            released: HostCounter::new(
                "scheduler_offers_released_total",
                "Offer claims released without a launch",
            ),
        }
    }
}
