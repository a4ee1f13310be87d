//! Metrics collection for back-office monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Back-office counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Operations executed (replays excluded).
    pub operations_total: AtomicU64,
    /// Operations that returned a failure.
    pub operations_failed: AtomicU64,
    /// Responses served from the idempotency cache.
    pub idempotent_replays: AtomicU64,
    /// Failures of the audit gate.
    pub audit_failures: AtomicU64,
    /// Deposits reconciled.
    pub reconciliations: AtomicU64,
    /// Deposits rejected by the provider.
    pub rejections: AtomicU64,
    /// Webhook or verify calls for already-final deposits.
    pub duplicate_confirmations: AtomicU64,
    /// Provider calls that failed.
    pub provider_failures: AtomicU64,
    /// Verifications currently running.
    pub verifications_active: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of an executed operation.
    pub fn operation(&self, success: bool, error_code: Option<&str>) {
        self.operations_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.operations_failed.fetch_add(1, Ordering::Relaxed);
        }
        if error_code == Some("AUDIT_LOG_FAILED") {
            self.audit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn replay(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconciled(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_confirmation(&self) {
        self.duplicate_confirmations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn provider_failure(&self) {
        self.provider_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_started(&self) {
        self.verifications_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_finished(&self) {
        self.verifications_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_total: self.operations_total.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            duplicate_confirmations: self.duplicate_confirmations.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            verifications_active: self.verifications_active.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let series: [(&str, &str, &str, u64); 9] = [
            ("operations_total", "counter", "Operations executed", s.operations_total),
            ("operations_failed", "counter", "Operations that failed", s.operations_failed),
            ("idempotent_replays", "counter", "Responses replayed from the idempotency cache", s.idempotent_replays),
            ("audit_failures", "counter", "Audit gate failures", s.audit_failures),
            ("reconciliations", "counter", "Deposits reconciled", s.reconciliations),
            ("rejections", "counter", "Deposits rejected by the provider", s.rejections),
            ("duplicate_confirmations", "counter", "Confirmations of already final deposits", s.duplicate_confirmations),
            ("provider_failures", "counter", "Failed payment provider calls", s.provider_failures),
            ("verifications_active", "gauge", "Verifications in progress", s.verifications_active),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP vaultline_{name} {help}\n# TYPE vaultline_{name} {kind}\nvaultline_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations_total: u64,
    pub operations_failed: u64,
    pub idempotent_replays: u64,
    pub audit_failures: u64,
    pub reconciliations: u64,
    pub rejections: u64,
    pub duplicate_confirmations: u64,
    pub provider_failures: u64,
    pub verifications_active: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.operation(true, None);
        metrics.operation(false, Some("AUDIT_LOG_FAILED"));
        metrics.replay();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_total, 2);
        assert_eq!(snapshot.operations_failed, 1);
        assert_eq!(snapshot.audit_failures, 1);
        assert_eq!(snapshot.idempotent_replays, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.reconciled();

        let output = metrics.to_prometheus();
        assert!(output.contains("vaultline_reconciliations 1"));
        assert!(output.contains("# TYPE vaultline_verifications_active gauge"));
    }
}
