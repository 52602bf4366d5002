//! Prometheus metrics for evalgate executions.
//!
//! Provides counters and a duration histogram labelled by outcome, plus an
//! error counter labelled by `errorType`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::outcome::Outcome;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// "success" or "failure".
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The reported `errorType`.
    pub error_type: String,
}

/// Prometheus metrics for the evaluator.
pub struct EvalMetrics {
    /// Total number of executions.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
    /// Total number of failures by `errorType`.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl EvalMetrics {
    /// Create a new `EvalMetrics` and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "evalgate_executions",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter())
            });
        registry.register(
            "evalgate_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "evalgate_errors",
            "Total failed executions by error type",
            errors_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
        }
    }

    /// Record a finished execution.
    pub fn record(&self, outcome: &Outcome, duration_secs: f64) {
        let labels = ExecutionLabels {
            outcome: if outcome.is_success() { "success" } else { "failure" }.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);

        if let Some(error_type) = outcome.error_type() {
            self.record_error(error_type);
        }
    }

    /// Record a failure of the given `errorType`.
    ///
    /// Used directly for failures that never reach the evaluator, such as
    /// undecodable request bodies.
    pub fn record_error(&self, error_type: &str) {
        let labels = ErrorLabels {
            error_type: error_type.to_string(),
        };
        self.errors_total.get_or_create(&labels).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn success() -> Outcome {
        Outcome::Success { retval: None }
    }

    #[test]
    fn metrics_01_execution_counter_splits_by_outcome() {
        let mut registry = Registry::default();
        let metrics = EvalMetrics::new(&mut registry);
        metrics.record(&success(), 0.5);
        metrics.record(&success(), 1.0);
        metrics.record(&Outcome::failure("boom", "string"), 0.1);

        let ok = ExecutionLabels {
            outcome: "success".into(),
        };
        let failed = ExecutionLabels {
            outcome: "failure".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&ok).get(), 2);
        assert_eq!(metrics.executions_total.get_or_create(&failed).get(), 1);
    }

    #[test]
    fn metrics_02_failures_count_by_error_type() {
        let mut registry = Registry::default();
        let metrics = EvalMetrics::new(&mut registry);
        metrics.record(&Outcome::failure("t", "timeout"), 5.0);
        metrics.record(&Outcome::failure("t", "timeout"), 5.0);
        metrics.record_error("decoding");
        metrics.record(&success(), 0.01);

        let timeout = ErrorLabels {
            error_type: "timeout".into(),
        };
        let decoding = ErrorLabels {
            error_type: "decoding".into(),
        };
        assert_eq!(metrics.errors_total.get_or_create(&timeout).get(), 2);
        assert_eq!(metrics.errors_total.get_or_create(&decoding).get(), 1);
    }

    #[test]
    fn metrics_03_metrics_encode_to_text() {
        let mut registry = Registry::default();
        let metrics = EvalMetrics::new(&mut registry);
        metrics.record(&success(), 0.002);
        metrics.record(&Outcome::failure("x", "object"), 0.003);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();

        assert!(buffer.contains("evalgate_executions_total"));
        assert!(buffer.contains("evalgate_execution_duration_seconds"));
        assert!(buffer.contains("evalgate_errors_total"));
        assert!(buffer.contains(r#"outcome="success""#));
        assert!(buffer.contains(r#"error_type="object""#));
    }

    #[test]
    fn metrics_04_metrics_thread_safe() {
        let mut registry = Registry::default();
        let metrics = std::sync::Arc::new(EvalMetrics::new(&mut registry));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record(&Outcome::Success { retval: None }, 0.001);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let labels = ExecutionLabels {
            outcome: "success".into(),
        };
        assert_eq!(metrics.executions_total.get_or_create(&labels).get(), 800);
    }
}
