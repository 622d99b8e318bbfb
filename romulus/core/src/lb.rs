//! The load balancer adapter seam.
//!
//! An adapter translates [`Resource`]s into its proxy's configuration schema
//! and persists them. The engine only ever handles the adapter's values
//! through this trait, so it never depends on a particular encoding or key
//! layout.

use crate::Resource;
use anyhow::Result;
use std::fmt;

/// The outcome of an idempotent write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Write {
    Created,
    Updated,
    Unchanged,
}

/// Values with a stable identifier within their parent.
pub trait Keyed {
    fn id(&self) -> &str;
}

/// A value read back from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Persisted<T> {
    Valid(T),

    /// The stored value could not be decoded.
    Corrupt { id: String },
}

#[async_trait::async_trait]
pub trait LoadBalancer: Send + Sync + 'static {
    type Frontend: Keyed + fmt::Debug + Send + Sync;
    type Backend: Keyed + fmt::Debug + Send + Sync;
    type Server: Keyed + fmt::Debug + Send + Sync;
    type Middleware: Keyed + fmt::Debug + Send + Sync;

    fn new_frontend(&self, resource: &Resource) -> Result<Self::Frontend>;

    fn new_backend(&self, resource: &Resource) -> Result<Self::Backend>;

    fn new_servers(&self, resource: &Resource) -> Result<Vec<Self::Server>>;

    fn new_middlewares(&self, resource: &Resource) -> Result<Vec<Self::Middleware>>;

    async fn upsert_frontend(&self, frontend: &Self::Frontend) -> Result<Write>;

    async fn upsert_backend(&self, backend: &Self::Backend) -> Result<Write>;

    async fn upsert_server(&self, backend: &Self::Backend, server: &Self::Server)
        -> Result<Write>;

    async fn upsert_middleware(
        &self,
        frontend: &Self::Frontend,
        middleware: &Self::Middleware,
    ) -> Result<Write>;

    /// Removes a frontend and everything attached to it. Deleting a missing
    /// frontend succeeds.
    async fn delete_frontend(&self, frontend_id: &str) -> Result<()>;

    /// Removes a backend and its servers. Deleting a missing backend succeeds.
    async fn delete_backend(&self, backend_id: &str) -> Result<()>;

    async fn delete_server(&self, backend_id: &str, server_id: &str) -> Result<()>;

    async fn delete_middleware(&self, frontend_id: &str, middleware_id: &str) -> Result<()>;

    async fn get_frontend(&self, frontend_id: &str) -> Result<Option<Persisted<Self::Frontend>>>;

    async fn get_backend(&self, backend_id: &str) -> Result<Option<Persisted<Self::Backend>>>;

    async fn get_servers(&self, backend_id: &str) -> Result<Vec<Persisted<Self::Server>>>;

    async fn get_middlewares(
        &self,
        frontend_id: &str,
    ) -> Result<Vec<Persisted<Self::Middleware>>>;

    /// Checks connectivity to the underlying store.
    async fn status(&self) -> Result<()>;
}

// === impl Write ===

impl Write {
    pub fn is_changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for Write {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Persisted ===

impl<T: Keyed> Persisted<T> {
    pub fn id(&self) -> &str {
        match self {
            Self::Valid(v) => v.id(),
            Self::Corrupt { id } => id,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    pub fn valid(self) -> Option<T> {
        match self {
            Self::Valid(v) => Some(v),
            Self::Corrupt { .. } => None,
        }
    }
}
