//! Prometheus metrics for controllers.
//!
//! All series carry a `controller` label so several controllers can share one registry.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Reconcile and work queue metrics.
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    requeues_total: IntCounterVec,
    workqueue_depth: IntGaugeVec,
    workers_active: IntGaugeVec,
}

impl ControllerMetrics {
    /// Creates metrics without registering them anywhere.
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            reconcile_total: IntCounterVec::new(
                Opts::new("controller_reconcile_total", "Reconcile attempts by result"),
                &["controller", "result"],
            )?,
            reconcile_duration: HistogramVec::new(
                HistogramOpts::new(
                    "controller_reconcile_duration_seconds",
                    "Time spent in reconcile",
                )
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                &["controller"],
            )?,
            requeues_total: IntCounterVec::new(
                Opts::new("controller_requeues_total", "Keys requeued with backoff after a failure"),
                &["controller"],
            )?,
            workqueue_depth: IntGaugeVec::new(
                Opts::new("controller_workqueue_depth", "Keys ready to be processed"),
                &["controller"],
            )?,
            workers_active: IntGaugeVec::new(
                Opts::new("controller_workers_active", "Workers currently running reconcile"),
                &["controller"],
            )?,
        })
    }

    /// Creates metrics and registers them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.reconcile_total.clone()))?;
        registry.register(Box::new(metrics.reconcile_duration.clone()))?;
        registry.register(Box::new(metrics.requeues_total.clone()))?;
        registry.register(Box::new(metrics.workqueue_depth.clone()))?;
        registry.register(Box::new(metrics.workers_active.clone()))?;
        Ok(metrics)
    }

    pub(crate) fn reconcile_started(&self, controller: &str) {
        self.workers_active.with_label_values(&[controller]).inc();
    }

    pub(crate) fn reconcile_finished(&self, controller: &str, result: &str, elapsed: Duration) {
        self.workers_active.with_label_values(&[controller]).dec();
        self.reconcile_total
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn requeued(&self, controller: &str) {
        self.requeues_total.with_label_values(&[controller]).inc();
    }

    pub(crate) fn set_queue_depth(&self, controller: &str, depth: usize) {
        self.workqueue_depth
            .with_label_values(&[controller])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Reconcile attempts of `controller` that ended with `result`.
    pub fn reconcile_count(&self, controller: &str, result: &str) -> u64 {
        self.reconcile_total
            .with_label_values(&[controller, result])
            .get()
    }

    /// Last reported ready-queue depth of `controller`.
    pub fn queue_depth(&self, controller: &str) -> i64 {
        self.workqueue_depth.with_label_values(&[controller]).get()
    }

    /// Backoff requeues recorded for `controller`.
    pub fn requeue_count(&self, controller: &str) -> u64 {
        self.requeues_total.with_label_values(&[controller]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_exposes_series() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::register(&registry).unwrap();

        metrics.reconcile_started("hellotype");
        metrics.reconcile_finished("hellotype", "success", Duration::from_millis(3));
        metrics.requeued("hellotype");
        metrics.set_queue_depth("hellotype", 4);

        assert_eq!(metrics.reconcile_count("hellotype", "success"), 1);
        assert_eq!(metrics.requeue_count("hellotype"), 1);
        assert_eq!(metrics.queue_depth("hellotype"), 4);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.name().to_string())
            .collect();
        assert!(names.contains(&"controller_reconcile_total".to_string()));
        assert!(names.contains(&"controller_workqueue_depth".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        ControllerMetrics::register(&registry).unwrap();
        assert!(ControllerMetrics::register(&registry).is_err());
    }
}
