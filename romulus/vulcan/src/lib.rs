//! A load balancer adapter for vulcand.
//!
//! vulcand reads its configuration from etcd:
//!
//! ```text
//! <root>/backends/<id>/backend
//! <root>/backends/<id>/servers/<server-id>
//! <root>/frontends/<id>/frontend
//! <root>/frontends/<id>/middlewares/<middleware-id>
//! ```
//!
//! Each resource maps to one backend and one frontend sharing the resource's
//! id.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod etcd;
pub mod model;
pub mod route;
mod store;

pub use self::{
    etcd::{EtcdStore, DEFAULT_TIMEOUT},
    model::{Backend, Frontend, Middleware, Server},
    store::{Error, MemoryStore, Store},
};
use anyhow::Result;
use romulus_core::{
    annotations::{self, Annotations},
    LoadBalancer, Persisted, Resource, Write,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_ROOT: &str = "/vulcand";

#[derive(Clone, Debug)]
pub struct Vulcan<S> {
    store: S,
    root: String,
}

// === impl Vulcan ===

impl<S: Store> Vulcan<S> {
    pub fn new(store: S, root: impl AsRef<str>) -> Self {
        let root = root.as_ref().trim_matches('/');
        Self {
            store,
            root: format!("/{root}"),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn backend_dir(&self, id: &str) -> String {
        format!("{}/backends/{}", self.root, id)
    }

    fn backend_key(&self, id: &str) -> String {
        format!("{}/backend", self.backend_dir(id))
    }

    fn servers_dir(&self, backend_id: &str) -> String {
        format!("{}/servers", self.backend_dir(backend_id))
    }

    fn frontend_dir(&self, id: &str) -> String {
        format!("{}/frontends/{}", self.root, id)
    }

    fn frontend_key(&self, id: &str) -> String {
        format!("{}/frontend", self.frontend_dir(id))
    }

    fn middlewares_dir(&self, frontend_id: &str) -> String {
        format!("{}/middlewares", self.frontend_dir(frontend_id))
    }

    /// Writes `value` unless the store already holds the same encoding.
    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<Write> {
        let encoded = serde_json::to_string(value)?;
        let write = match self.store.get(key).await? {
            Some(current) if current == encoded => return Ok(Write::Unchanged),
            Some(_) => Write::Updated,
            None => Write::Created,
        };
        self.store.set(key, &encoded).await?;
        debug!(%key, %write, "Stored");
        Ok(write)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        id: &str,
        set_id: impl FnOnce(&mut T, String),
    ) -> Result<Option<Persisted<T>>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        Ok(Some(decode(&raw, id, set_id)))
    }

    async fn read_dir<T: DeserializeOwned>(
        &self,
        dir: &str,
        set_id: impl Fn(&mut T, String),
    ) -> Result<Vec<Persisted<T>>> {
        let entries = self.store.list(dir).await?;
        Ok(entries
            .into_iter()
            .map(|(key, raw)| {
                let id = key.rsplit('/').next().unwrap_or_default().to_string();
                decode(&raw, &id, &set_id)
            })
            .collect())
    }
}

fn decode<T: DeserializeOwned>(
    raw: &str,
    id: &str,
    set_id: impl FnOnce(&mut T, String),
) -> Persisted<T> {
    match serde_json::from_str::<T>(raw) {
        Ok(mut value) => {
            set_id(&mut value, id.to_string());
            Persisted::Valid(value)
        }
        Err(error) => {
            warn!(%id, %error, "Stored value is corrupt");
            Persisted::Corrupt { id: id.to_string() }
        }
    }
}

/// Reads a settings object from flattened annotations. Anything other than
/// a JSON object is ignored.
fn settings(resource: &Resource, key: &str) -> Option<Value> {
    let raw = resource.annotations.get(key)?;
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => {
            warn!(resource = %resource.id, annotation = %key, "Settings must be a JSON object");
            None
        }
        Err(error) => {
            warn!(resource = %resource.id, annotation = %key, %error, "Invalid settings");
            None
        }
    }
}

fn middlewares(resource: &Resource, annotations: &Annotations) -> Vec<Middleware> {
    annotations::middlewares(annotations)
        .filter_map(|(id, raw)| {
            match serde_json::from_str::<model::MiddlewareSpec>(raw) {
                Ok(spec) => Some(spec.into_middleware(id)),
                Err(error) => {
                    warn!(resource = %resource.id, middleware = %id, %error, "Invalid middleware");
                    None
                }
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl<S: Store> LoadBalancer for Vulcan<S> {
    type Frontend = Frontend;
    type Backend = Backend;
    type Server = Server;
    type Middleware = Middleware;

    fn new_frontend(&self, resource: &Resource) -> Result<Frontend> {
        Ok(Frontend {
            id: resource.id.clone(),
            kind: model::HTTP.to_string(),
            backend_id: resource.id.clone(),
            route: route::compile(&resource.route),
            settings: settings(resource, annotations::FRONTEND_SETTINGS),
        })
    }

    fn new_backend(&self, resource: &Resource) -> Result<Backend> {
        Ok(Backend {
            id: resource.id.clone(),
            kind: model::HTTP.to_string(),
            settings: settings(resource, annotations::BACKEND_SETTINGS),
        })
    }

    fn new_servers(&self, resource: &Resource) -> Result<Vec<Server>> {
        Ok(resource
            .servers
            .iter()
            .map(|s| Server {
                id: s.id.clone(),
                url: s.url(),
            })
            .collect())
    }

    fn new_middlewares(&self, resource: &Resource) -> Result<Vec<Middleware>> {
        Ok(middlewares(resource, &resource.annotations))
    }

    async fn upsert_frontend(&self, frontend: &Frontend) -> Result<Write> {
        self.put(&self.frontend_key(&frontend.id), frontend).await
    }

    async fn upsert_backend(&self, backend: &Backend) -> Result<Write> {
        self.put(&self.backend_key(&backend.id), backend).await
    }

    async fn upsert_server(&self, backend: &Backend, server: &Server) -> Result<Write> {
        let key = format!("{}/{}", self.servers_dir(&backend.id), server.id);
        self.put(&key, server).await
    }

    async fn upsert_middleware(
        &self,
        frontend: &Frontend,
        middleware: &Middleware,
    ) -> Result<Write> {
        let key = format!("{}/{}", self.middlewares_dir(&frontend.id), middleware.id);
        self.put(&key, middleware).await
    }

    async fn delete_frontend(&self, frontend_id: &str) -> Result<()> {
        self.store
            .delete(&self.frontend_dir(frontend_id), true)
            .await?;
        Ok(())
    }

    async fn delete_backend(&self, backend_id: &str) -> Result<()> {
        self.store.delete(&self.backend_dir(backend_id), true).await?;
        Ok(())
    }

    async fn delete_server(&self, backend_id: &str, server_id: &str) -> Result<()> {
        let key = format!("{}/{}", self.servers_dir(backend_id), server_id);
        self.store.delete(&key, false).await?;
        Ok(())
    }

    async fn delete_middleware(&self, frontend_id: &str, middleware_id: &str) -> Result<()> {
        let key = format!("{}/{}", self.middlewares_dir(frontend_id), middleware_id);
        self.store.delete(&key, false).await?;
        Ok(())
    }

    async fn get_frontend(&self, frontend_id: &str) -> Result<Option<Persisted<Frontend>>> {
        self.read(&self.frontend_key(frontend_id), frontend_id, |f: &mut Frontend, id| {
            f.id = id
        })
        .await
    }

    async fn get_backend(&self, backend_id: &str) -> Result<Option<Persisted<Backend>>> {
        self.read(&self.backend_key(backend_id), backend_id, |b: &mut Backend, id| {
            b.id = id
        })
        .await
    }

    async fn get_servers(&self, backend_id: &str) -> Result<Vec<Persisted<Server>>> {
        self.read_dir(&self.servers_dir(backend_id), |s: &mut Server, id| s.id = id)
            .await
    }

    async fn get_middlewares(&self, frontend_id: &str) -> Result<Vec<Persisted<Middleware>>> {
        self.read_dir(&self.middlewares_dir(frontend_id), |m: &mut Middleware, id| {
            m.id = id
        })
        .await
    }

    async fn status(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }
}
