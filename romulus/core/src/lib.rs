#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core types for romulus.
//!
//! A [`Resource`] is the unit of reconciliation: a route, a pool of servers
//! and the annotations they were derived from. Resources are built from
//! cluster objects by the index crate and written to a load balancer through
//! the [`LoadBalancer`] adapter trait.

pub mod annotations;
pub mod lb;
mod resource;
pub mod route;

pub use self::{
    annotations::{Annotations, Keyspace, PortScope},
    lb::{Keyed, LoadBalancer, Persisted, Write},
    resource::{server_id, Resource, Scheme, Server, SERVER_ID_LEN},
    route::{build_route, Route, RouteError, RouteKind, RoutePart},
};
