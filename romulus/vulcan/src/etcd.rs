use crate::store::{Error, Store};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A client for etcd's v2 keys API.
///
/// Requests are sent to each peer in order until one of them responds.
#[derive(Clone, Debug)]
pub struct EtcdStore {
    client: Client,
    peers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
struct Node {
    key: String,

    #[serde(default)]
    value: Option<String>,

    #[serde(default)]
    dir: bool,

    #[serde(default)]
    nodes: Vec<Node>,
}

// === impl EtcdStore ===

impl EtcdStore {
    pub fn new<I>(peers: I, timeout: Duration) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let peers = peers
            .into_iter()
            .map(|p| p.as_ref().trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, peers })
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    /// Sends a request to the first peer that responds.
    async fn send(
        &self,
        method: Method,
        path: &str,
        configure: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, Error> {
        let mut last = Error::NoPeers;
        for peer in &self.peers {
            let url = format!("{peer}{path}");
            let req = configure(self.client.request(method.clone(), &url));
            match req.send().await {
                Ok(rsp) => return Ok(rsp),
                Err(error) => {
                    warn!(%peer, %error, "etcd peer unavailable");
                    last = error.into();
                }
            }
        }
        Err(last)
    }

    async fn keys(
        &self,
        method: Method,
        key: &str,
        configure: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Option<Response>, Error> {
        let rsp = self.send(method, &keys_path(key), configure).await?;
        if rsp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !rsp.status().is_success() {
            let status = rsp.status().as_u16();
            let message = rsp.text().await.unwrap_or_default();
            return Err(Error::Status {
                key: key.to_string(),
                status,
                message,
            });
        }
        Ok(Some(rsp))
    }

    async fn node(&self, key: &str, query: &[(&str, &str)]) -> Result<Option<Node>, Error> {
        let Some(rsp) = self.keys(Method::GET, key, |req| req.query(query)).await? else {
            return Ok(None);
        };
        let body = rsp.bytes().await?;
        let KeysResponse { node } =
            serde_json::from_slice(&body).map_err(|source| Error::Decode {
                key: key.to_string(),
                source,
            })?;
        Ok(Some(node))
    }
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.node(key, &[]).await?.and_then(|n| n.value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        debug!(%key, "Setting");
        let form = [("value", value)];
        self.keys(Method::PUT, key, |req| req.form(&form)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error> {
        debug!(%key, recursive, "Deleting");
        let query: &[(&str, &str)] = if recursive {
            &[("recursive", "true")]
        } else {
            &[]
        };
        self.keys(Method::DELETE, key, |req| req.query(query)).await?;
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, Error> {
        let Some(node) = self.node(dir, &[("sorted", "true")]).await? else {
            return Ok(vec![]);
        };
        Ok(node
            .nodes
            .into_iter()
            .filter(|n| !n.dir)
            .filter_map(|n| Some((n.key, n.value?)))
            .collect())
    }

    async fn ping(&self) -> Result<(), Error> {
        let rsp = self.send(Method::GET, "/version", |req| req).await?;
        if !rsp.status().is_success() {
            return Err(Error::Status {
                key: "/version".to_string(),
                status: rsp.status().as_u16(),
                message: rsp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn keys_path(key: &str) -> String {
    format!("/v2/keys/{}", key.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::StatusCode as Status,
        routing::get,
        Form, Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

    type Keys = Arc<Mutex<BTreeMap<String, String>>>;

    /// Serves a small subset of the v2 keys API.
    async fn fake_etcd() -> (String, Keys) {
        let keys = Keys::default();
        let app = Router::new()
            .route("/version", get(|| async { "{\"etcdserver\":\"2.3.8\"}" }))
            .route(
                "/v2/keys/{*key}",
                get(read_key).put(write_key).delete(delete_key),
            )
            .with_state(keys.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), keys)
    }

    async fn read_key(
        State(keys): State<Keys>,
        Path(key): Path<String>,
    ) -> Result<Json<Value>, Status> {
        let key = format!("/{key}");
        let keys = keys.lock();
        if let Some(value) = keys.get(&key) {
            return Ok(Json(json!({ "node": { "key": key, "value": value } })));
        }
        let dir = format!("{key}/");
        let mut nodes = Vec::new();
        let mut subdirs = Vec::new();
        for (k, v) in keys.iter().filter(|(k, _)| k.starts_with(&dir)) {
            match k[dir.len()..].split_once('/') {
                None => nodes.push(json!({ "key": k, "value": v })),
                Some((sub, _)) => {
                    let sub = format!("{dir}{sub}");
                    if !subdirs.contains(&sub) {
                        nodes.push(json!({ "key": sub, "dir": true }));
                        subdirs.push(sub);
                    }
                }
            }
        }
        if nodes.is_empty() {
            return Err(Status::NOT_FOUND);
        }
        Ok(Json(
            json!({ "node": { "key": key, "dir": true, "nodes": nodes } }),
        ))
    }

    async fn write_key(
        State(keys): State<Keys>,
        Path(key): Path<String>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Status {
        match form.get("value") {
            Some(value) => {
                keys.lock().insert(format!("/{key}"), value.clone());
                Status::CREATED
            }
            None => Status::BAD_REQUEST,
        }
    }

    async fn delete_key(
        State(keys): State<Keys>,
        Path(key): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Status {
        let key = format!("/{key}");
        let mut keys = keys.lock();
        let mut found = keys.remove(&key).is_some();
        if query.get("recursive").map(String::as_str) == Some("true") {
            let dir = format!("{key}/");
            let before = keys.len();
            keys.retain(|k, _| !k.starts_with(&dir));
            found |= keys.len() != before;
        }
        if found {
            Status::OK
        } else {
            Status::NOT_FOUND
        }
    }

    #[tokio::test]
    async fn keys_roundtrip() {
        let (url, keys) = fake_etcd().await;
        let store = EtcdStore::new([url], DEFAULT_TIMEOUT).unwrap();

        store.ping().await.unwrap();
        assert_eq!(store.get("/vulcand/backends/a/backend").await.unwrap(), None);

        let value = r#"{"Type":"http","Settings":{"Note":"<a&b>"}}"#;
        store.set("/vulcand/backends/a/backend", value).await.unwrap();
        store
            .set("/vulcand/backends/a/servers/s1", r#"{"URL":"http://10.0.0.5:80"}"#)
            .await
            .unwrap();
        assert_eq!(
            store.get("/vulcand/backends/a/backend").await.unwrap().as_deref(),
            Some(value)
        );

        let servers = store.list("/vulcand/backends/a/servers").await.unwrap();
        assert_eq!(
            servers,
            vec![(
                "/vulcand/backends/a/servers/s1".to_string(),
                r#"{"URL":"http://10.0.0.5:80"}"#.to_string()
            )]
        );
        // Subdirectories aren't values.
        assert_eq!(
            store.list("/vulcand/backends/a").await.unwrap(),
            vec![(
                "/vulcand/backends/a/backend".to_string(),
                value.to_string()
            )]
        );

        store.delete("/vulcand/backends/a", true).await.unwrap();
        assert!(keys.lock().is_empty());
        store.delete("/vulcand/backends/a", true).await.unwrap();
        assert!(store.list("/vulcand/backends/a/servers").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_later_peers() {
        let (url, _keys) = fake_etcd().await;

        // Nothing listens on a port that was just released.
        let unused = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let store = EtcdStore::new([format!("http://{unused}"), url], DEFAULT_TIMEOUT).unwrap();
        store.set("/k", "v").await.unwrap();
        assert_eq!(store.get("/k").await.unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn requires_peers() {
        assert!(matches!(
            EtcdStore::new(Vec::<String>::new(), DEFAULT_TIMEOUT),
            Err(Error::NoPeers)
        ));
    }
}
