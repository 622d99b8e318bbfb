//! vulcand's configuration objects, as stored in etcd.

use romulus_core::Keyed;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HTTP: &str = "http";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Backend {
    #[serde(skip)]
    pub id: String,

    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(skip)]
    pub id: String,

    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Frontend {
    #[serde(skip)]
    pub id: String,

    #[serde(rename = "Type")]
    pub kind: String,

    pub backend_id: String,

    pub route: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Middleware {
    pub id: String,

    #[serde(rename = "Type", alias = "type")]
    pub kind: String,

    #[serde(default, alias = "priority")]
    pub priority: i64,

    #[serde(alias = "middleware")]
    pub middleware: Value,
}

macro_rules! keyed {
    ($($ty:ty),+) => {
        $(
            impl Keyed for $ty {
                fn id(&self) -> &str {
                    &self.id
                }
            }
        )+
    };
}

keyed!(Backend, Server, Frontend, Middleware);

/// A middleware definition as written in an annotation. The id comes from
/// the annotation key.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MiddlewareSpec {
    #[serde(rename = "Type", alias = "type")]
    pub kind: String,

    #[serde(default, rename = "Priority", alias = "priority")]
    pub priority: i64,

    #[serde(rename = "Middleware", alias = "middleware")]
    pub middleware: Value,
}

// === impl MiddlewareSpec ===

impl MiddlewareSpec {
    pub(crate) fn into_middleware(self, id: &str) -> Middleware {
        Middleware {
            id: id.to_string(),
            kind: self.kind,
            priority: self.priority,
            middleware: self.middleware,
        }
    }
}
