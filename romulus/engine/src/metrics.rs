use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use romulus_core::Write;

#[derive(Clone, Debug, Default)]
pub struct EngineMetrics {
    passes: Family<PassLabels, Counter>,
    writes: Family<WriteLabels, Counter>,
    retries: Family<OpLabels, Counter>,
    requeues: Counter,
    resyncs: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PassLabels {
    kind: String,
    op: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WriteLabels {
    object: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OpLabels {
    op: String,
}

// === impl EngineMetrics ===

impl EngineMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let passes = Family::default();
        prom.register(
            "passes",
            "Count of reconciliation passes by object kind, event and result",
            passes.clone(),
        );

        let writes = Family::default();
        prom.register(
            "writes",
            "Count of load balancer writes by object and result",
            writes.clone(),
        );

        let retries = Family::default();
        prom.register(
            "retries",
            "Count of retried load balancer operations",
            retries.clone(),
        );

        let requeues = Counter::default();
        prom.register(
            "requeues",
            "Count of events requeued after a failed pass",
            requeues.clone(),
        );

        let resyncs = Counter::default();
        prom.register("resyncs", "Count of periodic resyncs", resyncs.clone());

        Self {
            passes,
            writes,
            retries,
            requeues,
            resyncs,
        }
    }

    pub(crate) fn pass(&self, kind: &str, op: &str, result: &str) {
        self.passes
            .get_or_create(&PassLabels {
                kind: kind.to_string(),
                op: op.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn passes(&self, kind: &str, op: &str, result: &str) -> u64 {
        self.passes
            .get_or_create(&PassLabels {
                kind: kind.to_string(),
                op: op.to_string(),
                result: result.to_string(),
            })
            .get()
    }

    pub(crate) fn wrote(&self, object: &str, write: Write) {
        self.write(object, write.as_str());
    }

    pub(crate) fn deleted(&self, object: &str) {
        self.write(object, "deleted");
    }

    fn write(&self, object: &str, result: &str) {
        self.writes
            .get_or_create(&WriteLabels {
                object: object.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    pub(crate) fn retried(&self, op: &str) {
        self.retries
            .get_or_create(&OpLabels { op: op.to_string() })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn requeues(&self) -> u64 {
        self.requeues.get()
    }

    pub(crate) fn requeued(&self) {
        self.requeues.inc();
    }

    pub(crate) fn resynced(&self) {
        self.resyncs.inc();
    }
}
