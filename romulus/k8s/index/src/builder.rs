use crate::{
    backend_list::{service_ports, BackendList},
    cache::ObjectCache,
};
use romulus_core::{
    annotations::{self, Annotations, Keyspace, PortScope},
    build_route, Resource, Scheme,
};
use romulus_k8s_api::{
    ClusterObject, Endpoints, Ingress, IngressServiceBackend, ObjectKind, Resource as _,
    ResourceExt, Selector, Service, ServicePort,
};
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};
use tracing::{debug, warn};


/// Derives resources from cluster objects.
#[derive(Clone, Debug)]
pub struct Builder {
    cache: ObjectCache,
    keyspace: Keyspace,
    selector: Selector,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("service {namespace}/{name} not found")]
    MissingService { namespace: String, name: String },

    #[error("{0} errors can't be built into resources")]
    Unsupported(ObjectKind),
}

/// A Service state that overrides the cache while building dependents.
struct Pinned {
    name: String,
    service: Arc<Service>,
    endpoints: Option<Arc<Endpoints>>,
}

/// An ingress rule path (or the default backend) targeting a Service port.
struct Target<'i> {
    rule: String,
    host: Option<&'i str>,
    path: Option<(&'i str, &'i str)>,
    service: &'i IngressServiceBackend,
}

// === impl Builder ===

impl Builder {
    pub fn new(cache: ObjectCache, keyspace: Keyspace, selector: Selector) -> Self {
        Self {
            cache,
            keyspace,
            selector,
        }
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Builds every resource derived from `obj`, ordered by id.
    ///
    /// Services and Endpoints also yield the resources of the cached
    /// Ingresses that route to the Service.
    pub fn build(&self, obj: &ClusterObject) -> Result<Vec<Resource>, BuildError> {
        let resources = match obj {
            ClusterObject::Service(svc) => {
                let namespace = svc.namespace().unwrap_or_default();
                let name = svc.name_any();
                let endpoints = self.cache.get::<Endpoints>(&namespace, &name);
                if endpoints.is_none() && self.selector.matches(svc.meta()) {
                    warn!(%namespace, %name, "Service has no endpoints");
                }
                self.service_and_dependents(svc.clone(), endpoints)
            }

            ClusterObject::Endpoints(ep) => {
                let service = self.companion(ep)?;
                self.service_and_dependents(service, Some(ep.clone()))
            }

            ClusterObject::Ingress(ing) => self.ingress(ing, None, None),
        };
        Ok(by_id(resources))
    }

    /// Rebuilds the Service behind a deleted Endpoints object as if it had no
    /// endpoints, so that its servers are removed.
    pub fn build_without_endpoints(&self, ep: &Endpoints) -> Result<Vec<Resource>, BuildError> {
        let service = self.companion(ep)?;
        Ok(by_id(self.service_and_dependents(service, None)))
    }

    fn companion(&self, ep: &Endpoints) -> Result<Arc<Service>, BuildError> {
        let namespace = ep.namespace().unwrap_or_default();
        let name = ep.name_any();
        self.cache
            .get::<Service>(&namespace, &name)
            .ok_or(BuildError::MissingService { namespace, name })
    }

    fn service_and_dependents(
        &self,
        service: Arc<Service>,
        endpoints: Option<Arc<Endpoints>>,
    ) -> Vec<Resource> {
        let mut resources = self.service(&service, endpoints.as_deref());

        let namespace = service.namespace().unwrap_or_default();
        let pinned = Pinned {
            name: service.name_any(),
            service,
            endpoints,
        };
        for ing in self.cache.list::<Ingress>(Some(&namespace)) {
            if routes_to(&ing, &pinned.name) {
                resources.extend(self.ingress(&ing, Some(&pinned.name), Some(&pinned)));
            }
        }

        resources
    }

    fn service(&self, svc: &Service, endpoints: Option<&Endpoints>) -> Vec<Resource> {
        if !self.selector.matches(svc.meta()) {
            debug!(namespace = ?svc.namespace(), name = %svc.name_any(), "Service not selected");
            return vec![];
        }

        let list = BackendList::new(svc);
        if list.is_empty() {
            let annotations = self.keyspace.scoped(svc.annotations(), None, &[]);
            let mut resource = Resource::new(list.portless_id());
            resource.uid = svc.uid();
            self.configure(&mut resource, annotations);
            return vec![resource];
        }

        service_ports(svc)
            .iter()
            .enumerate()
            .filter_map(|(i, port)| {
                let id = list.backend_id(i)?;
                Some(self.port(id, svc.uid(), svc, port, svc.annotations(), endpoints))
            })
            .collect()
    }

    fn ingress(&self, ing: &Ingress, only: Option<&str>, pinned: Option<&Pinned>) -> Vec<Resource> {
        if !self.selector.matches(ing.meta()) {
            debug!(namespace = ?ing.namespace(), name = %ing.name_any(), "Ingress not selected");
            return vec![];
        }

        let namespace = ing.namespace().unwrap_or_default();
        let ingress = ing.name_any();
        let mut resources = Vec::new();

        for backend in ingress_backends(ing) {
            let service = backend.service.name.as_str();
            if only.is_some_and(|name| name != service) {
                continue;
            }

            let Some((svc, endpoints)) = self.lookup(&namespace, service, pinned) else {
                warn!(%namespace, %ingress, %service, "Ingress backend service not found");
                continue;
            };
            let list = BackendList::new(&svc);
            let index = backend.service.port.as_ref().and_then(|p| list.resolve(p));
            let Some((index, id)) =
                index.and_then(|i| Some((i, list.ingress_id(i, &ingress, &backend.rule)?)))
            else {
                warn!(
                    %namespace,
                    %ingress,
                    %service,
                    port = ?backend.service.port,
                    "Ingress backend port not found",
                );
                continue;
            };
            let Some(port) = service_ports(&svc).get(index) else {
                continue;
            };

            let mut overlay = svc.annotations().clone();
            overlay.extend(ing.annotations().clone());

            let mut resource = self.port(id, ing.uid(), &svc, port, &overlay, endpoints.as_deref());
            if let Some(host) = backend.host {
                if let Err(error) = resource.route.set_host(host) {
                    warn!(%error, resource = %resource.id, "Invalid ingress host");
                }
            }
            if let Some((path, path_type)) = backend.path {
                let res = match path_type {
                    "Exact" => resource.route.set_path(path),
                    _ => resource.route.set_prefix(path),
                };
                if let Err(error) = res {
                    warn!(%error, resource = %resource.id, "Invalid ingress path");
                }
            }
            resources.push(resource);
        }

        resources
    }

    fn lookup(
        &self,
        namespace: &str,
        name: &str,
        pinned: Option<&Pinned>,
    ) -> Option<(Arc<Service>, Option<Arc<Endpoints>>)> {
        if let Some(p) = pinned.filter(|p| p.name == name) {
            return Some((p.service.clone(), p.endpoints.clone()));
        }
        let svc = self.cache.get::<Service>(namespace, name)?;
        Some((svc, self.cache.get::<Endpoints>(namespace, name)))
    }

    /// Builds the resource for a single service port.
    fn port(
        &self,
        id: String,
        uid: Option<String>,
        svc: &Service,
        port: &ServicePort,
        annotations: &Annotations,
        endpoints: Option<&Endpoints>,
    ) -> Resource {
        let scopes = service_ports(svc).iter().map(scope).collect::<Vec<_>>();
        let annotations = self.keyspace.scoped(annotations, Some(scope(port)), &scopes);

        let mut resource = Resource::new(id);
        resource.uid = uid;
        let scheme = self.configure(&mut resource, annotations);

        if let Some(endpoints) = endpoints {
            for (ip, port) in endpoint_addrs(endpoints, port) {
                resource.add_server(scheme, ip, port);
            }
            if resource.servers.is_empty() {
                if let Some(ip) = fallback_ip(svc) {
                    match u16::try_from(port.port) {
                        Ok(p) => resource.add_server(scheme, ip, p),
                        Err(_) => warn!(port = port.port, "Invalid service port"),
                    }
                }
            }
        }

        resource.servers.sort_by(|a, b| a.id.cmp(&b.id));
        resource
    }

    /// Applies flattened annotations to a resource, returning the scheme its
    /// servers use.
    fn configure(&self, resource: &mut Resource, annotations: Annotations) -> Scheme {
        resource.route = build_route(&resource.id, &annotations);
        resource.websocket = annotations::flag(&annotations, annotations::WEBSOCKET);
        let scheme = match annotations.get(annotations::BACKEND_TYPE) {
            Some(v) => v.parse().unwrap_or_else(|error| {
                warn!(%error, resource = %resource.id, "Ignoring backend type");
                Scheme::default()
            }),
            None => Scheme::default(),
        };
        resource.annotations = annotations;
        scheme
    }
}

fn scope(port: &ServicePort) -> PortScope<'_> {
    PortScope::new(port.name.as_deref(), u16::try_from(port.port).ok())
}

/// Lists the ready addresses that serve a service port, in a stable order.
fn endpoint_addrs(endpoints: &Endpoints, port: &ServicePort) -> Vec<(IpAddr, u16)> {
    let port_name = port.name.as_deref().filter(|n| !n.is_empty());
    let mut addrs = Vec::new();

    for subset in endpoints.subsets.iter().flatten() {
        for ep_port in subset.ports.iter().flatten() {
            let ep_name = ep_port.name.as_deref().filter(|n| !n.is_empty());
            if let (Some(a), Some(b)) = (port_name, ep_name) {
                if a != b {
                    continue;
                }
            }
            let Ok(number) = u16::try_from(ep_port.port) else {
                continue;
            };

            for addr in subset.addresses.iter().flatten() {
                match addr.ip.parse::<IpAddr>() {
                    Ok(ip) => addrs.push((ip, number)),
                    Err(error) => warn!(%error, ip = %addr.ip, "Invalid endpoint address"),
                }
            }
        }
    }

    addrs.sort();
    addrs.dedup();
    addrs
}

/// The address used when a Service's endpoints yield no servers. Headless
/// services have none.
fn fallback_ip(svc: &Service) -> Option<IpAddr> {
    let spec = svc.spec.as_ref()?;
    match spec.cluster_ip.as_deref() {
        Some("None") => None,
        Some(ip) if !ip.is_empty() => ip.parse().ok(),
        _ => spec
            .external_ips
            .iter()
            .flatten()
            .find_map(|ip| ip.parse().ok()),
    }
}

fn ingress_backends(ing: &Ingress) -> Vec<Target<'_>> {
    let Some(spec) = ing.spec.as_ref() else {
        return vec![];
    };
    let mut backends = Vec::new();

    if let Some(service) = spec.default_backend.as_ref().and_then(|b| b.service.as_ref()) {
        backends.push(Target {
            rule: "default".to_string(),
            host: None,
            path: None,
            service,
        });
    }

    for (i, rule) in spec.rules.iter().flatten().enumerate() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for (j, path) in http.paths.iter().enumerate() {
            let Some(service) = path.backend.service.as_ref() else {
                debug!(rule = i, path = j, "Skipping non-service ingress backend");
                continue;
            };
            backends.push(Target {
                rule: format!("{i}-{j}"),
                host: rule.host.as_deref().filter(|h| !h.is_empty()),
                path: path
                    .path
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(|p| (p, path.path_type.as_str())),
                service,
            });
        }
    }

    backends
}

fn routes_to(ing: &Ingress, service: &str) -> bool {
    ingress_backends(ing)
        .iter()
        .any(|b| b.service.name == service)
}

/// Orders resources by id. A later resource replaces an earlier one with the
/// same id.
fn by_id(resources: Vec<Resource>) -> Vec<Resource> {
    resources
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}
