use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use romulus_k8s_api::ObjectKind;

#[derive(Clone, Debug, Default)]
pub struct FeedMetrics {
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    stale: Family<KindLabels, Counter>,
    cache_size: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl FeedMetrics ===

impl FeedMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let applies = Family::default();
        prom.register(
            "cache_applies",
            "Count of objects applied to the cache",
            applies.clone(),
        );

        let deletes = Family::default();
        prom.register(
            "cache_deletes",
            "Count of objects deleted from the cache",
            deletes.clone(),
        );

        let stale = Family::default();
        prom.register(
            "cache_stale_updates",
            "Count of updates ignored because the cache held a newer version",
            stale.clone(),
        );

        let cache_size = Gauge::default();
        prom.register(
            "cache_size",
            "Gauge of the number of objects in the cache",
            cache_size.clone(),
        );

        Self {
            applies,
            deletes,
            stale,
            cache_size,
        }
    }

    pub(crate) fn applied(&self, kind: ObjectKind) {
        self.applies.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub(crate) fn deleted(&self, kind: ObjectKind) {
        self.deletes.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub(crate) fn rejected_stale(&self, kind: ObjectKind) {
        self.stale.get_or_create(&KindLabels::from(kind)).inc();
    }

    pub fn set_cache_size(&self, size: usize) {
        self.cache_size.set(size as i64);
    }
}

impl From<ObjectKind> for KindLabels {
    fn from(kind: ObjectKind) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}
