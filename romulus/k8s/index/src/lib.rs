//! Indexes cluster objects and derives routable resources from them.
//!
//! Watch events are applied to an [`ObjectCache`] by the [`Feed`], which
//! publishes each observed change as a [`ClusterEvent`] on a channel. The
//! [`Builder`] reads the cache to join Services with their Endpoints and
//! Ingresses with their backend Services.
//!
//! ```text
//! [ Ingress ] -> [ Service ] <- [ Endpoints ]
//! ```
//!
//! [`ClusterEvent`]: romulus_k8s_api::ClusterEvent

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backend_list;
mod builder;
pub mod cache;
mod feed;
pub mod metrics;

pub use self::{
    backend_list::BackendList,
    builder::{BuildError, Builder},
    cache::{ObjectCache, Put},
    feed::{watch_errors, Feed},
    metrics::FeedMetrics,
};
