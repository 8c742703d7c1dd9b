use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts reconciliations by controller.
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles: Family<ControllerLabels, Counter>,
    failures: Family<FailureLabels, Counter>,
    requeues: Family<ControllerLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControllerLabels {
    controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    controller: String,
    kind: String,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciliations started",
            reconciles.clone(),
        );

        let failures = Family::default();
        prom.register(
            "reconcile_errors",
            "Count of failed reconciliations by error kind",
            failures.clone(),
        );

        let requeues = Family::default();
        prom.register(
            "requeues",
            "Count of reconciliations that scheduled a delayed requeue",
            requeues.clone(),
        );

        Self {
            reconciles,
            failures,
            requeues,
        }
    }

    pub(crate) fn reconciled(&self, controller: &str) {
        self.reconciles
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .inc();
    }

    pub(crate) fn failed(&self, controller: &str, transient: bool) {
        self.failures
            .get_or_create(&FailureLabels {
                controller: controller.to_string(),
                kind: if transient { "transient" } else { "invariant" }.to_string(),
            })
            .inc();
    }

    pub(crate) fn requeued(&self, controller: &str) {
        self.requeues
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn reconcile_count(&self, controller: &str) -> u64 {
        self.reconciles
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .get()
    }
}
