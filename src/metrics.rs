use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Process-wide reload counters. Lock-free; incremented from any worker.
pub struct Metrics {
    registry: Registry,
    reload_executed: IntCounterVec,
    reload_by_namespace: IntCounterVec,
    reload_noop: IntCounter,
}

impl Metrics {
    fn new() -> Metrics {
        let registry = Registry::new();

        let reload_executed = IntCounterVec::new(
            Opts::new(
                "reloader_reload_executed_total",
                "Reload attempts by outcome",
            ),
            &["success"],
        )
        .unwrap();
        let reload_by_namespace = IntCounterVec::new(
            Opts::new(
                "reloader_reload_executed_by_namespace_total",
                "Reload attempts by outcome and namespace",
            ),
            &["success", "namespace"],
        )
        .unwrap();
        let reload_noop = IntCounter::new(
            "reloader_reload_skipped_total",
            "Reconciliations skipped because the stamped value was already current",
        )
        .unwrap();

        registry.register(Box::new(reload_executed.clone())).unwrap();
        registry
            .register(Box::new(reload_by_namespace.clone()))
            .unwrap();
        registry.register(Box::new(reload_noop.clone())).unwrap();

        Metrics {
            registry,
            reload_executed,
            reload_by_namespace,
            reload_noop,
        }
    }

    pub fn global() -> &'static Metrics {
        &METRICS
    }

    pub fn record_success(&self, namespace: &str) {
        self.reload_executed.with_label_values(&["true"]).inc();
        self.reload_by_namespace
            .with_label_values(&["true", namespace])
            .inc();
    }

    pub fn record_failure(&self, namespace: &str) {
        self.reload_executed.with_label_values(&["false"]).inc();
        self.reload_by_namespace
            .with_label_values(&["false", namespace])
            .inc();
    }

    pub fn record_noop(&self) {
        self.reload_noop.inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(%error, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        let metrics = Metrics::global();
        metrics.record_success("default");
        metrics.record_failure("default");
        metrics.record_noop();

        let rendered = metrics.render();
        assert!(rendered.contains("reloader_reload_executed_total"));
        assert!(rendered.contains("reloader_reload_executed_by_namespace_total"));
        assert!(rendered.contains("reloader_reload_skipped_total"));
        assert!(rendered.contains("namespace=\"default\""));
    }
}
