use crate::{
    cache::{ObjectCache, Put},
    metrics::FeedMetrics,
};
use parking_lot::RwLock;
use romulus_k8s_api::{
    watcher, ApiError, Change, ClusterEvent, Endpoints, Ingress, ObjectKind, Resource, ResourceExt,
    Service, Watched,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Applies watch updates to the cache and publishes them as cluster events.
///
/// The feed is driven by `kubert::index::namespaced`, one task per watched
/// kind, all sharing one cache and one event channel.
#[derive(Debug)]
pub struct Feed {
    cache: ObjectCache,
    tx: mpsc::UnboundedSender<ClusterEvent>,
    metrics: FeedMetrics,
}

// === impl Feed ===

impl Feed {
    pub fn new(
        cache: ObjectCache,
        tx: mpsc::UnboundedSender<ClusterEvent>,
        metrics: FeedMetrics,
    ) -> Self {
        Self { cache, tx, metrics }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn apply_object<K: Watched>(&mut self, obj: K) {
        let obj = Arc::new(obj);
        self.metrics.applied(K::KIND);
        let change = match self.cache.put(obj.clone()) {
            Put::Inserted => Change::Added(obj),
            Put::Replaced(old) => Change::Updated { old, new: obj },
            // A relist re-observed the cached version; there is nothing to
            // reconcile.
            Put::Refreshed => return,
            Put::Stale => {
                debug!(
                    kind = %K::KIND,
                    namespace = ?obj.namespace(),
                    name = %obj.name_any(),
                    "Ignoring stale update",
                );
                self.metrics.rejected_stale(K::KIND);
                return;
            }
        };
        self.metrics.set_cache_size(self.cache.len());
        self.publish(K::event(change));
    }

    fn delete_object<K: Watched>(&mut self, namespace: String, name: String) {
        self.metrics.deleted(K::KIND);
        let obj = match self.cache.delete::<K>(&namespace, &name) {
            Some(obj) => obj,
            None => {
                debug!(kind = %K::KIND, %namespace, %name, "Deleted object was not cached");
                Arc::new(tombstone::<K>(namespace, name))
            }
        };
        self.metrics.set_cache_size(self.cache.len());
        self.publish(K::event(Change::Deleted(obj)));
    }

    fn publish(&self, event: ClusterEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

macro_rules! index_kind {
    ($ty:ty) => {
        impl kubert::index::IndexNamespacedResource<$ty> for Feed {
            fn apply(&mut self, resource: $ty) {
                self.apply_object(resource)
            }

            fn delete(&mut self, namespace: String, name: String) {
                self.delete_object::<$ty>(namespace, name)
            }
        }
    };
}

index_kind!(Service);
index_kind!(Endpoints);
index_kind!(Ingress);

/// An object that only carries the namespace and name of a deleted object.
fn tombstone<K: Watched>(namespace: String, name: String) -> K {
    let mut obj = K::default();
    let meta = obj.meta_mut();
    meta.namespace = Some(namespace);
    meta.name = Some(name);
    obj
}

/// Returns a watch error callback that reports failures on the event channel.
pub fn watch_errors(
    tx: mpsc::UnboundedSender<ClusterEvent>,
    kind: ObjectKind,
) -> impl Fn(&watcher::Error) + Send + Sync + 'static {
    move |error| {
        let _ = tx.send(ClusterEvent::ApiError(ApiError {
            kind,
            message: error.to_string(),
        }));
    }
}
