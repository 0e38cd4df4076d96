//! Operator-wide Prometheus metrics.
//!
//! `prometheus-client`'s registry rejects a same-named gauge registered
//! more than once, so per-reconciler counts are tracked as a single gauge
//! family keyed on `(namespace, reconciler)` labels rather than one gauge
//! per reconciler.

use prometheus_client::encoding::{text::encode, EncodeLabelSet};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcilerLabels {
    pub namespace: String,
    pub reconciler: String,
}

/// Process-wide gauges exposed on `operator.metrics_port`.
pub struct OperatorMetrics {
    registry: Registry,
    threads_by_reconciler: Family<ReconcilerLabels, Gauge>,
    active_threads: Gauge,
}

impl OperatorMetrics {
    /// Registers both gauges once, at operator construction time, not per
    /// reconciler addition.
    pub fn new() -> Self {
        Self::with_registry(Registry::default())
    }

    /// Registers both gauges into a caller-supplied registry, e.g. one that
    /// already carries `kuroboros-k8s-util`'s client-request metrics, so a
    /// single `/metrics` endpoint serves both.
    pub fn with_registry(mut registry: Registry) -> Self {
        let threads_by_reconciler = Family::<ReconcilerLabels, Gauge>::default();
        registry.register(
            "kuroboros_python_threads_by_reconciler",
            "The number of tasks running by the CRD controller",
            threads_by_reconciler.clone(),
        );
        let active_threads = Gauge::default();
        registry.register(
            "active_threads",
            "Total number of process-wide tasks managed by the operator",
            active_threads.clone(),
        );
        Self {
            registry,
            threads_by_reconciler,
            active_threads,
        }
    }

    pub fn set_reconciler_count(&self, namespace: &str, reconciler: &str, count: i64) {
        self.threads_by_reconciler
            .get_or_create(&ReconcilerLabels {
                namespace: namespace.to_string(),
                reconciler: reconciler.to_string(),
            })
            .set(count);
    }

    pub fn set_active_threads(&self, count: i64) {
        self.active_threads.set(count);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).unwrap_or_default();
        buffer
    }
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_contains_registered_metric_names() {
        let metrics = OperatorMetrics::new();
        metrics.set_reconciler_count("default", "WidgetReconciler", 3);
        metrics.set_active_threads(7);
        let text = metrics.encode();
        assert!(text.contains("kuroboros_python_threads_by_reconciler"));
        assert!(text.contains("active_threads"));
    }
}
