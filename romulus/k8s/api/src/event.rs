use crate::{Endpoints, Ingress, ObjectMeta, Resource, ResourceExt, Service};
use std::{fmt, sync::Arc};

/// A change to a watched cluster object, as delivered to the reconciler.
#[derive(Clone, Debug)]
pub enum ClusterEvent {
    Service(Change<Service>),
    Endpoints(Change<Endpoints>),
    Ingress(Change<Ingress>),
    ApiError(ApiError),
}

#[derive(Clone, Debug)]
pub enum Change<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    Deleted(Arc<T>),
}

/// A failure reported by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ObjectKind,
    pub message: String,
}

/// A snapshot of one watched object.
#[derive(Clone, Debug)]
pub enum ClusterObject {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    Ingress(Arc<Ingress>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Service,
    Endpoints,
    Ingress,
}

/// The object kinds this controller watches.
pub trait Watched:
    Resource<DynamicType = ()> + Clone + Default + fmt::Debug + Send + Sync + 'static
{
    const KIND: ObjectKind;

    fn event(change: Change<Self>) -> ClusterEvent;

    fn object(obj: Arc<Self>) -> ClusterObject;

    fn from_object(obj: &ClusterObject) -> Option<Arc<Self>>;
}

macro_rules! watched {
    ($ty:ident) => {
        impl Watched for $ty {
            const KIND: ObjectKind = ObjectKind::$ty;

            fn event(change: Change<Self>) -> ClusterEvent {
                ClusterEvent::$ty(change)
            }

            fn object(obj: Arc<Self>) -> ClusterObject {
                ClusterObject::$ty(obj)
            }

            fn from_object(obj: &ClusterObject) -> Option<Arc<Self>> {
                match obj {
                    ClusterObject::$ty(o) => Some(o.clone()),
                    _ => None,
                }
            }
        }
    };
}

watched!(Service);
watched!(Endpoints);
watched!(Ingress);

// === impl ClusterEvent ===

impl ClusterEvent {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Service(_) => ObjectKind::Service,
            Self::Endpoints(_) => ObjectKind::Endpoints,
            Self::Ingress(_) => ObjectKind::Ingress,
            Self::ApiError(e) => e.kind,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Self::Service(c) => c.op(),
            Self::Endpoints(c) => c.op(),
            Self::Ingress(c) => c.op(),
            Self::ApiError(_) => "error",
        }
    }

    /// The object the event is about, taken from its most recent state.
    pub fn object(&self) -> Option<ClusterObject> {
        match self {
            Self::Service(c) => Some(ClusterObject::Service(c.latest().clone())),
            Self::Endpoints(c) => Some(ClusterObject::Endpoints(c.latest().clone())),
            Self::Ingress(c) => Some(ClusterObject::Ingress(c.latest().clone())),
            Self::ApiError(_) => None,
        }
    }
}

// === impl Change ===

impl<T> Change<T> {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Added(_) => "add",
            Self::Updated { .. } => "update",
            Self::Deleted(_) => "delete",
        }
    }

    pub fn latest(&self) -> &Arc<T> {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }
}

// === impl ClusterObject ===

impl ClusterObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Service(_) => ObjectKind::Service,
            Self::Endpoints(_) => ObjectKind::Endpoints,
            Self::Ingress(_) => ObjectKind::Ingress,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Service(o) => o.meta(),
            Self::Endpoints(o) => o.meta(),
            Self::Ingress(o) => o.meta(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Service(o) => o.name_any(),
            Self::Endpoints(o) => o.name_any(),
            Self::Ingress(o) => o.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }
}

// === impl ObjectKind ===

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Endpoints => "endpoints",
            Self::Ingress => "ingress",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} watch failed: {}", self.kind, self.message)
    }
}
