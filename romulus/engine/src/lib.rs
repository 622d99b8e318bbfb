//! Reconciles cluster events into a load balancer's configuration.
//!
//! Each event is handled as one pass: the affected resources are rebuilt from
//! the object cache and written through the [`LoadBalancer`] adapter. Passes
//! never overlap. Writes are retried with backoff, and a pass that still
//! fails is requeued.
//!
//! [`LoadBalancer`]: romulus_core::LoadBalancer

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod commit;
mod engine;
pub mod metrics;
mod worker;


pub use self::{
    commit::Backoff,
    engine::{Config, Engine},
    metrics::EngineMetrics,
    worker::run,
};
use romulus_k8s_index::BuildError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{op} {id} failed after {attempts} attempts")]
    Exhausted {
        op: &'static str,
        id: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("invalid load balancer configuration for {id}")]
    Adapter {
        id: String,
        #[source]
        source: BoxError,
    },

    #[error("reconciliation cancelled")]
    Cancelled,
}

// === impl Error ===

impl Error {
    /// Whether the failed pass may succeed if it is tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}
