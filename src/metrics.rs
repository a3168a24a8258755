use crate::keys::ObjectKey;
use crate::Error;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub status_patches: IntCounter,
    pub routing_errors: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "synctarget_export_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "synctarget_export_controller_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new(
            "synctarget_export_controller_reconciliations_total",
            "reconciliations",
        )
        .unwrap();
        let status_patches = IntCounter::new(
            "synctarget_export_controller_status_patches_total",
            "status patches sent to the API server",
        )
        .unwrap();
        let routing_errors = IntCounterVec::new(
            opts!(
                "synctarget_export_controller_routing_errors_total",
                "watch events that could not be mapped to SyncTargets",
            ),
            &["kind", "error"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            status_patches,
            routing_errors,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.status_patches.clone()))?;
        registry.register(Box::new(self.routing_errors.clone()))?;
        registry.register(Box::new(crate::runtime::HANDLED_ERRORS.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, key: &ObjectKey, e: &Error) {
        self.failures
            .with_label_values(&[T::kind(&()).as_ref(), key.to_string().as_str(), e.metric_label()])
            .inc()
    }

    pub fn routing_failure(&self, kind: &str, e: &Error) {
        self.routing_errors
            .with_label_values(&[kind, e.metric_label()])
            .inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logicalcluster::LogicalClusterName;
    use crate::resources::synctargets::SyncTarget;

    #[test]
    fn failures_are_labelled_by_key_and_error() {
        let metrics = Metrics::default();
        let key = ObjectKey::cluster_scoped(LogicalClusterName::new("root"), "target");
        let err = Error::NotFound {
            kind: "APIExport".into(),
            key: "root|e".into(),
        };
        metrics.reconcile_failure::<SyncTarget>(&key, &err);
        metrics.reconcile_failure::<SyncTarget>(&key, &err);
        assert_eq!(
            metrics
                .failures
                .with_label_values(&["SyncTarget", "root|target", "NotFound"])
                .get(),
            2
        );
    }

    #[test]
    fn measurer_observes_on_drop() {
        let metrics = Metrics::default();
        drop(metrics.count_and_measure::<SyncTarget>());
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .reconcile_duration
                .with_label_values(&["SyncTarget"])
                .get_sample_count(),
            1
        );
    }
}
