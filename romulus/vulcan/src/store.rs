use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

/// A hierarchical key-value store, as exposed by etcd's v2 keys API.
///
/// Keys are absolute, `/`-separated paths.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Deletes a key, or a directory and its contents when `recursive`.
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error>;

    /// Lists the values stored directly under `dir` as `(key, value)` pairs.
    /// A missing directory is empty.
    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, Error>;

    async fn ping(&self) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{key}: unexpected status {status}: {message}")]
    Status {
        key: String,
        status: u16,
        message: String,
    },

    #[error("{key}: invalid response: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no etcd peers configured")]
    NoPeers,

    #[error("store unavailable")]
    Unavailable,
}

/// An in-memory store.
///
/// Clones share state. Every mutation is counted so that callers can assert
/// on write activity.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
    writes: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sets and effective deletes performed.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Stores a raw value without counting it as a write.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    /// Makes the next `n` operations fail with [`Error::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Makes every operation fail until the store is made available again.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failed {
            Ok(_) => Err(Error::Unavailable),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.check()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.check()?;
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error> {
        self.check()?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.remove(key);
        if recursive {
            let dir = format!("{}/", key.trim_end_matches('/'));
            entries.retain(|k, _| !k.starts_with(&dir));
        }
        if entries.len() != before {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, Error> {
        self.check()?;
        let dir = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .entries
            .read()
            .range(dir.clone()..)
            .take_while(|(k, _)| k.starts_with(&dir))
            .filter(|(k, _)| !k[dir.len()..].contains('/'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn ping(&self) -> Result<(), Error> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_direct_children() {
        let store = MemoryStore::new();
        store.set("/a/b/1", "one").await.unwrap();
        store.set("/a/b/2", "two").await.unwrap();
        store.set("/a/b/c/3", "three").await.unwrap();
        store.set("/a/bb/4", "four").await.unwrap();

        assert_eq!(
            store.list("/a/b").await.unwrap(),
            vec![
                ("/a/b/1".to_string(), "one".to_string()),
                ("/a/b/2".to_string(), "two".to_string()),
            ]
        );
        assert!(store.list("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recursive_deletes() {
        let store = MemoryStore::new();
        store.set("/a/b/1", "one").await.unwrap();
        store.set("/a/b/c/3", "three").await.unwrap();
        store.set("/a/bb/4", "four").await.unwrap();
        assert_eq!(store.writes(), 3);

        store.delete("/a/b", false).await.unwrap();
        assert_eq!(store.writes(), 3, "deleting a missing key isn't a write");

        store.delete("/a/b", true).await.unwrap();
        assert_eq!(store.keys(), vec!["/a/bb/4".to_string()]);
        assert_eq!(store.writes(), 4);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(matches!(store.ping().await, Err(Error::Unavailable)));
        assert!(matches!(store.get("/a").await, Err(Error::Unavailable)));
        assert!(store.ping().await.is_ok());

        store.set_available(false);
        assert!(matches!(store.set("/a", "1").await, Err(Error::Unavailable)));
        store.set_available(true);
        assert!(store.set("/a", "1").await.is_ok());
    }
}
