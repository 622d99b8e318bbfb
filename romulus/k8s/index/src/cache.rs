use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use romulus_k8s_api::{ClusterObject, ObjectKind, ResourceExt, Watched};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Holds the most recent state of every watched object.
///
/// Entries expire after a TTL; an expired entry reads as absent until it is
/// purged or replaced. Any put, including one that re-observes the cached
/// version, extends an entry's expiry. Objects are always stored whole.
#[derive(Clone, Debug)]
pub struct ObjectCache {
    entries: Arc<RwLock<HashMap<Key, Entry>>>,
    ttl: Duration,
}

/// The outcome of [`ObjectCache::put`].
#[derive(Debug)]
pub enum Put<K> {
    Inserted,
    Replaced(Arc<K>),

    /// The cached object has the same resource version. Only its expiry was
    /// extended.
    Refreshed,

    /// The cached object has a newer resource version; nothing was stored.
    Stale,
}

type Key = (ObjectKind, String, String);

#[derive(Debug)]
struct Entry {
    object: ClusterObject,
    expires: Instant,
}

// === impl ObjectCache ===

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ObjectCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Default::default(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put<K: Watched>(&self, obj: Arc<K>) -> Put<K> {
        let key = key::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any());
        let now = Instant::now();
        let mut entries = self.entries.write();

        let old = entries
            .get(&key)
            .filter(|e| e.expires > now)
            .and_then(|e| K::from_object(&e.object));
        if let Some(old) = old.as_ref() {
            let cached = old.resource_version();
            let incoming = obj.resource_version();
            if is_stale(cached.as_deref(), incoming.as_deref()) {
                return Put::Stale;
            }
            if cached.is_some() && cached == incoming {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.expires = now + self.ttl;
                }
                return Put::Refreshed;
            }
        }

        entries.insert(
            key,
            Entry {
                object: K::object(obj),
                expires: now + self.ttl,
            },
        );
        match old {
            Some(old) => Put::Replaced(old),
            None => Put::Inserted,
        }
    }

    pub fn get<K: Watched>(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let now = Instant::now();
        self.entries
            .read()
            .get(&key::<K>(namespace, name))
            .filter(|e| e.expires > now)
            .and_then(|e| K::from_object(&e.object))
    }

    pub fn delete<K: Watched>(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let now = Instant::now();
        self.entries
            .write()
            .remove(&key::<K>(namespace, name))
            .filter(|e| e.expires > now)
            .and_then(|e| K::from_object(&e.object))
    }

    /// Lists live objects of a kind, optionally within a single namespace,
    /// ordered by namespace and name.
    pub fn list<K: Watched>(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut objs = entries
            .iter()
            .filter(|((kind, ns, _), e)| {
                *kind == K::KIND
                    && e.expires > now
                    && namespace.map_or(true, |n| n == ns.as_str())
            })
            .filter_map(|((_, ns, name), e)| Some(((ns, name), K::from_object(&e.object)?)))
            .collect::<Vec<_>>();
        objs.sort_by(|(a, _), (b, _)| a.cmp(b));
        objs.into_iter().map(|(_, obj)| obj).collect()
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| e.expires > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires > now);
        before - entries.len()
    }
}

fn key<K: Watched>(namespace: &str, name: &str) -> Key {
    (K::KIND, namespace.to_string(), name.to_string())
}

/// Resource versions are compared numerically. Versions that can't be
/// parsed never make an update stale.
fn is_stale(cached: Option<&str>, incoming: Option<&str>) -> bool {
    let parse = |v: Option<&str>| v.and_then(|v| v.parse::<u64>().ok());
    match (parse(cached), parse(incoming)) {
        (Some(cached), Some(incoming)) => incoming < cached,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use romulus_k8s_api::{Endpoints, ObjectMeta, Service};

    fn svc(ns: &str, name: &str, version: &str) -> Arc<Service> {
        Arc::new(Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn put_replaces_whole_objects() {
        let cache = ObjectCache::default();
        assert!(matches!(cache.put(svc("ns", "foo", "1")), Put::Inserted));
        match cache.put(svc("ns", "foo", "2")) {
            Put::Replaced(old) => assert_eq!(old.resource_version().as_deref(), Some("1")),
            put => panic!("unexpected put: {put:?}"),
        }
        let current = cache.get::<Service>("ns", "foo").expect("cached");
        assert_eq!(current.resource_version().as_deref(), Some("2"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn stale_versions_are_rejected() {
        let cache = ObjectCache::default();
        cache.put(svc("ns", "foo", "10"));
        assert!(matches!(cache.put(svc("ns", "foo", "9")), Put::Stale));
        assert_eq!(
            cache
                .get::<Service>("ns", "foo")
                .and_then(|s| s.resource_version()),
            Some("10".to_string())
        );

        // Versions that aren't numeric are always accepted.
        assert!(matches!(cache.put(svc("ns", "foo", "10")), Put::Refreshed));
        assert!(matches!(cache.put(svc("ns", "foo", "abc")), Put::Replaced(_)));
        assert!(matches!(cache.put(svc("ns", "foo", "1")), Put::Replaced(_)));
    }

    #[tokio::test]
    async fn kinds_are_keyed_separately() {
        let cache = ObjectCache::default();
        cache.put(svc("ns", "foo", "1"));
        assert!(cache.get::<Endpoints>("ns", "foo").is_none());
        assert!(cache.delete::<Endpoints>("ns", "foo").is_none());
        assert!(cache.get::<Service>("ns", "foo").is_some());
        assert!(cache.delete::<Service>("ns", "foo").is_some());
        assert!(cache.get::<Service>("ns", "foo").is_none());
    }

    #[tokio::test]
    async fn list_is_ordered_and_filtered() {
        let cache = ObjectCache::default();
        cache.put(svc("b", "x", "1"));
        cache.put(svc("a", "z", "1"));
        cache.put(svc("a", "y", "1"));

        let names = |svcs: Vec<Arc<Service>>| {
            svcs.iter()
                .map(|s| format!("{}/{}", s.namespace().unwrap_or_default(), s.name_any()))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(cache.list::<Service>(None)), vec!["a/y", "a/z", "b/x"]);
        assert_eq!(names(cache.list::<Service>(Some("b"))), vec!["b/x"]);
        assert!(cache.list::<Endpoints>(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        cache.put(svc("ns", "foo", "1"));
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.put(svc("ns", "bar", "1"));
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get::<Service>("ns", "foo").is_none());
        assert!(cache.get::<Service>("ns", "bar").is_some());
        assert_eq!(cache.len(), 1);

        // An expired entry doesn't count as a prior state.
        assert!(matches!(cache.put(svc("ns", "foo", "0")), Put::Inserted));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get::<Service>("ns", "foo").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reobserved_entries_stay_live() {
        let cache = ObjectCache::new(Duration::from_secs(60));
        cache.put(svc("ns", "foo", "7"));

        // A relist re-observes the same version well within the TTL.
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(matches!(cache.put(svc("ns", "foo", "7")), Put::Refreshed));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(
            cache
                .get::<Service>("ns", "foo")
                .and_then(|s| s.resource_version()),
            Some("7".to_string())
        );

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(cache.get::<Service>("ns", "foo").is_none());
    }
}
