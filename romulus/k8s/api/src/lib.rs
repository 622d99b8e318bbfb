#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod event;
pub mod labels;
pub mod watch;

pub use self::{
    event::{ApiError, Change, ClusterEvent, ClusterObject, ObjectKind, Watched},
    labels::Selector,
    watch::Watch,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort,
            ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};
