use crate::{
    commit::{self, Backoff},
    metrics::EngineMetrics,
    Error,
};
use romulus_core::{Keyed, LoadBalancer, Resource};
use romulus_k8s_api::{
    Change, ClusterEvent, ClusterObject, Ingress, ObjectKind, ResourceExt, Service, Watched,
};
use romulus_k8s_index::{BuildError, Builder, ObjectCache};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    sync::Arc,
};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub retry: Backoff,

    /// How long a failed event waits before it is handled again.
    pub requeue_delay: Duration,

    /// How often every cached object is reconciled again.
    pub resync_interval: Duration,
}

/// Reconciles resources into a load balancer.
pub struct Engine<L> {
    lb: L,
    builder: Builder,
    config: Config,
    metrics: EngineMetrics,
    shutdown: CancellationToken,
    pass: Mutex<Committed>,
}

/// The resource ids written for each Service or Ingress.
///
/// Endpoints record under their Service. An owner's ids may include those of
/// dependent Ingress resources.
type Committed = HashMap<Owner, BTreeSet<String>>;

type Owner = (ObjectKind, String, String);

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: Backoff::default(),
            requeue_delay: Duration::from_secs(10),
            resync_interval: Duration::from_secs(5 * 60),
        }
    }
}

// === impl Engine ===

impl<L: LoadBalancer> Engine<L> {
    pub fn new(
        lb: L,
        builder: Builder,
        config: Config,
        metrics: EngineMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            lb,
            builder,
            config,
            metrics,
            shutdown,
            pass: Mutex::new(Committed::default()),
        }
    }

    pub fn lb(&self) -> &L {
        &self.lb
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Handles a cluster event as a single pass.
    pub async fn handle(&self, event: &ClusterEvent) -> Result<(), Error> {
        let res = match event {
            ClusterEvent::Service(change) => self.on_change(change).await,
            ClusterEvent::Endpoints(change) => self.on_change(change).await,
            ClusterEvent::Ingress(change) => self.on_change(change).await,
            ClusterEvent::ApiError(e) => Err(BuildError::Unsupported(e.kind).into()),
        };
        let result = if res.is_ok() { "ok" } else { "error" };
        self.metrics
            .pass(event.kind().as_str(), event.op(), result);
        res
    }

    async fn on_change<K: Watched>(&self, change: &Change<K>) -> Result<(), Error> {
        match change {
            Change::Added(obj) => self.on_add(&K::object(obj.clone())).await,
            Change::Updated { old, new } => {
                self.on_update(&K::object(old.clone()), &K::object(new.clone()))
                    .await
            }
            Change::Deleted(obj) => self.on_delete(&K::object(obj.clone())).await,
        }
    }

    pub async fn on_add(&self, obj: &ClusterObject) -> Result<(), Error> {
        let mut committed = self.pass.lock().await;
        let desired = self.builder.build(obj)?;
        self.reconcile(&mut committed, owner(obj), desired, BTreeSet::new())
            .await
    }

    /// Applies the new state of an object, then removes the resources that
    /// were committed for it but are no longer desired.
    pub async fn on_update(&self, old: &ClusterObject, new: &ClusterObject) -> Result<(), Error> {
        let mut committed = self.pass.lock().await;
        let desired = self.builder.build(new)?;
        let previous = match self.builder.build(old) {
            Ok(previous) => ids(&previous),
            Err(error) => {
                debug!(%error, "Previous state can't be built");
                BTreeSet::new()
            }
        };
        self.reconcile(&mut committed, owner(new), desired, previous)
            .await
    }

    /// Removes an object's resources. A deleted Endpoints object only removes
    /// its Service's servers.
    pub async fn on_delete(&self, obj: &ClusterObject) -> Result<(), Error> {
        let mut committed = self.pass.lock().await;
        if let ClusterObject::Endpoints(ep) = obj {
            let desired = match self.builder.build_without_endpoints(ep) {
                Ok(desired) => desired,
                Err(BuildError::MissingService { namespace, name }) => {
                    debug!(%namespace, %name, "Service already removed");
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            };
            return self
                .reconcile(&mut committed, owner(obj), desired, BTreeSet::new())
                .await;
        }

        // The deleted object may be a tombstone without a spec, so the ids
        // committed for it are removed along with whatever it still builds.
        let mut stale = committed.get(&owner(obj)).cloned().unwrap_or_default();
        stale.extend(ids(&self.builder.build(obj)?));
        self.retire(&mut committed, owner(obj), stale).await
    }

    /// Refreshes a requeued event against the cache, returning `None` when
    /// there is nothing left to do.
    pub fn refresh(&self, event: ClusterEvent) -> Option<ClusterEvent> {
        let cache = self.builder.cache();
        match event {
            ClusterEvent::Service(change) => refresh(cache, change).map(ClusterEvent::Service),
            ClusterEvent::Endpoints(change) => {
                refresh(cache, change).map(ClusterEvent::Endpoints)
            }
            ClusterEvent::Ingress(change) => refresh(cache, change).map(ClusterEvent::Ingress),
            ClusterEvent::ApiError(_) => None,
        }
    }

    /// Purges expired cache entries and reconciles every cached Service and
    /// Ingress. Resources committed for objects that are no longer cached are
    /// removed.
    pub async fn resync(&self) {
        let cache = self.builder.cache();
        let purged = cache.purge_expired();
        let services = cache.list::<Service>(None);
        let ingresses = cache.list::<Ingress>(None);
        info!(
            purged,
            services = services.len(),
            ingresses = ingresses.len(),
            "Resyncing"
        );
        self.metrics.resynced();

        let objects = services
            .into_iter()
            .map(ClusterObject::Service)
            .chain(ingresses.into_iter().map(ClusterObject::Ingress))
            .collect::<Vec<_>>();
        if let Err(Error::Cancelled) = self.retire_uncached(&objects).await {
            return;
        }

        for obj in objects {
            match self.on_add(&obj).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return,
                Err(error) => warn!(
                    %error,
                    kind = %obj.kind(),
                    namespace = %obj.namespace(),
                    name = %obj.name(),
                    "Resync failed",
                ),
            }
        }
    }

    async fn retire_uncached(&self, cached: &[ClusterObject]) -> Result<(), Error> {
        let mut committed = self.pass.lock().await;
        let cached = cached.iter().map(owner).collect::<HashSet<_>>();
        let orphans = committed
            .keys()
            .filter(|o| !cached.contains(*o))
            .cloned()
            .collect::<Vec<_>>();
        for orphan in orphans {
            let stale = committed.get(&orphan).cloned().unwrap_or_default();
            let (kind, namespace, name) = orphan.clone();
            debug!(%kind, %namespace, %name, resources = stale.len(), "Removing uncached object");
            match self.retire(&mut committed, orphan, stale).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => warn!(%error, %kind, %namespace, %name, "Resync failed"),
            }
        }
        Ok(())
    }

    /// Checks that the load balancer's store is reachable.
    pub async fn check_status(&self) -> Result<(), Error> {
        self.commit("status", "", || self.lb.status()).await
    }

    /// Upserts the desired resources, then removes the ones committed for the
    /// owner (or built from its previous state) that are no longer desired.
    async fn reconcile(
        &self,
        committed: &mut Committed,
        owner: Owner,
        desired: Vec<Resource>,
        previous: BTreeSet<String>,
    ) -> Result<(), Error> {
        let desired_ids = ids(&desired);
        let mut stale = committed.get(&owner).cloned().unwrap_or_default();
        stale.extend(previous);
        stale.retain(|id| !desired_ids.contains(id));

        // Anything that may have been written stays recorded until the pass
        // completes.
        committed
            .entry(owner.clone())
            .or_default()
            .extend(desired_ids.iter().cloned());

        for resource in &desired {
            self.upsert(resource).await?;
        }
        for id in &stale {
            self.remove(id).await?;
            if let Some(ids) = committed.get_mut(&owner) {
                ids.remove(id);
            }
        }

        if desired_ids.is_empty() {
            committed.remove(&owner);
        } else {
            committed.insert(owner, desired_ids);
        }
        Ok(())
    }

    /// Removes every resource in `stale` and forgets the owner once they are
    /// all gone.
    async fn retire(
        &self,
        committed: &mut Committed,
        owner: Owner,
        stale: BTreeSet<String>,
    ) -> Result<(), Error> {
        for id in &stale {
            self.remove(id).await?;
            if let Some(ids) = committed.get_mut(&owner) {
                ids.remove(id);
            }
        }
        committed.remove(&owner);
        Ok(())
    }

    /// Writes a resource: backend, servers, frontend, then middlewares.
    /// Persisted servers and middlewares that are no longer desired, or that
    /// can't be decoded, are deleted.
    async fn upsert(&self, resource: &Resource) -> Result<(), Error> {
        let id = resource.id.as_str();
        let adapter = |source: anyhow::Error| Error::Adapter {
            id: id.to_string(),
            source: source.into(),
        };
        let backend = self.lb.new_backend(resource).map_err(adapter)?;
        let servers = self.lb.new_servers(resource).map_err(adapter)?;
        let frontend = self.lb.new_frontend(resource).map_err(adapter)?;
        let middlewares = self.lb.new_middlewares(resource).map_err(adapter)?;

        let write = self
            .commit("upsert_backend", id, || self.lb.upsert_backend(&backend))
            .await?;
        self.metrics.wrote("backend", write);

        for server in &servers {
            let write = self
                .commit("upsert_server", id, || self.lb.upsert_server(&backend, server))
                .await?;
            self.metrics.wrote("server", write);
        }

        let desired = servers.iter().map(Keyed::id).collect::<HashSet<_>>();
        let persisted = self
            .commit("get_servers", id, || self.lb.get_servers(backend.id()))
            .await?;
        for stale in persisted
            .iter()
            .filter(|s| s.is_corrupt() || !desired.contains(s.id()))
        {
            debug!(
                resource = %id,
                server = %stale.id(),
                corrupt = stale.is_corrupt(),
                "Pruning server",
            );
            self.commit("delete_server", id, || {
                self.lb.delete_server(backend.id(), stale.id())
            })
            .await?;
            self.metrics.deleted("server");
        }

        let write = self
            .commit("upsert_frontend", id, || self.lb.upsert_frontend(&frontend))
            .await?;
        self.metrics.wrote("frontend", write);

        for middleware in &middlewares {
            let write = self
                .commit("upsert_middleware", id, || {
                    self.lb.upsert_middleware(&frontend, middleware)
                })
                .await?;
            self.metrics.wrote("middleware", write);
        }

        let desired = middlewares.iter().map(Keyed::id).collect::<HashSet<_>>();
        let persisted = self
            .commit("get_middlewares", id, || {
                self.lb.get_middlewares(frontend.id())
            })
            .await?;
        for stale in persisted
            .iter()
            .filter(|m| m.is_corrupt() || !desired.contains(m.id()))
        {
            debug!(
                resource = %id,
                middleware = %stale.id(),
                corrupt = stale.is_corrupt(),
                "Pruning middleware",
            );
            self.commit("delete_middleware", id, || {
                self.lb.delete_middleware(frontend.id(), stale.id())
            })
            .await?;
            self.metrics.deleted("middleware");
        }

        debug!(resource = %id, servers = servers.len(), route = %resource.route, "Upserted");
        Ok(())
    }

    /// Deletes a resource's frontend, then its backend.
    async fn remove(&self, id: &str) -> Result<(), Error> {
        self.commit("delete_frontend", id, || self.lb.delete_frontend(id))
            .await?;
        self.metrics.deleted("frontend");
        self.commit("delete_backend", id, || self.lb.delete_backend(id))
            .await?;
        self.metrics.deleted("backend");
        debug!(resource = %id, "Removed");
        Ok(())
    }

    async fn commit<T, F, Fut>(
        &self,
        op: &'static str,
        id: &str,
        operation: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        commit::retry(
            &self.config.retry,
            op,
            id,
            &self.shutdown,
            &self.metrics,
            operation,
        )
        .await
    }
}

/// The object whose resources an event reconciles. Endpoints belong to their
/// Service.
fn owner(obj: &ClusterObject) -> Owner {
    let kind = match obj.kind() {
        ObjectKind::Endpoints => ObjectKind::Service,
        kind => kind,
    };
    (kind, obj.namespace(), obj.name())
}

fn ids(resources: &[Resource]) -> BTreeSet<String> {
    resources.iter().map(|r| r.id.clone()).collect()
}

fn refresh<K: Watched>(cache: &ObjectCache, change: Change<K>) -> Option<Change<K>> {
    let current =
        |obj: &Arc<K>| cache.get::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any());
    match change {
        Change::Added(obj) => current(&obj).map(Change::Added),
        Change::Updated { old, new } => Some(match current(&new) {
            Some(new) => Change::Updated { old, new },
            None => Change::Deleted(old),
        }),
        Change::Deleted(obj) => Some(match current(&obj) {
            Some(new) => Change::Updated { old: obj, new },
            None => Change::Deleted(obj),
        }),
    }
}
