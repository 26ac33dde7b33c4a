use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rolling request counters, owned by one engine instance.
///
/// Counters are independent atomics; a snapshot taken mid-update may be off
/// by one request, which is fine for reporting.
#[derive(Debug, Default)]
pub struct ProcessingStats {
    total: AtomicU64,
    successful: AtomicU64,
    total_time_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_processing_ms: f64,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, success: bool, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        }
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.total_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed).min(total);
        let time = self.total_time_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful,
            average_processing_ms: if total == 0 {
                0.0
            } else {
                time as f64 / total as f64
            },
        }
    }
}

/// External metrics collaborator, called once per finished operation.
pub trait StatsSink: Send + Sync {
    fn record(&self, operation: &str, success: bool, elapsed: Duration);
}

/// Emits one structured log event per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn record(&self, operation: &str, success: bool, elapsed: Duration) {
        tracing::info!(
            target: "faceproofd::stats",
            operation,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            "operation finished"
        );
    }
}
