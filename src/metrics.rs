//! Process-wide decision counters.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Counters reported by the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Checks answered since the last reset
    pub total_requests: u64,
    /// Checks that were admitted
    pub allowed: u64,
    /// Checks that were rejected
    pub blocked: u64,
    /// Running mean of check latency in milliseconds
    pub avg_latency_ms: f64,
}

/// Decision counters shared by all request handlers.
#[derive(Debug, Default)]
pub struct Metrics {
    data: Mutex<MetricsSnapshot>,
}

impl Metrics {
    /// Counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one answered check.
    pub fn record(&self, allowed: bool, latency: Duration) {
        let mut data = self.data.lock();
        data.total_requests += 1;
        if allowed {
            data.allowed += 1;
        } else {
            data.blocked += 1;
        }

        let total = data.total_requests as f64;
        let latency_ms = latency.as_secs_f64() * 1_000.0;
        data.avg_latency_ms = (data.avg_latency_ms * (total - 1.0) + latency_ms) / total;
    }

    /// Copy of the counters at this instant.
    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.data.lock()
    }

    /// Zero every counter and the mean latency.
    pub fn reset(&self) {
        *self.data.lock() = MetricsSnapshot::default();
    }
}
