//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub ingested: AtomicU64,
    pub malformed: AtomicU64,
    pub observations: AtomicU64,
    pub overload: AtomicU64,
    pub insufficient_baseline: AtomicU64,
    pub windows_closed: AtomicU64,
    pub transitions: AtomicU64,
    pub invalid_transitions: AtomicU64,
    pub alerts_published: AtomicU64,
    pub sovereignty_denials: AtomicU64,
    pub transfers_authorized: AtomicU64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            ingested: get(&self.ingested),
            malformed: get(&self.malformed),
            observations: get(&self.observations),
            overload: get(&self.overload),
            insufficient_baseline: get(&self.insufficient_baseline),
            windows_closed: get(&self.windows_closed),
            transitions: get(&self.transitions),
            invalid_transitions: get(&self.invalid_transitions),
            alerts_published: get(&self.alerts_published),
            sovereignty_denials: get(&self.sovereignty_denials),
            transfers_authorized: get(&self.transfers_authorized),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ingested: u64,
    pub malformed: u64,
    pub observations: u64,
    pub overload: u64,
    pub insufficient_baseline: u64,
    pub windows_closed: u64,
    pub transitions: u64,
    pub invalid_transitions: u64,
    pub alerts_published: u64,
    pub sovereignty_denials: u64,
    pub transfers_authorized: u64,
}
