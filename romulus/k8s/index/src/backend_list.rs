use ahash::AHashMap as HashMap;
use romulus_k8s_api::{ResourceExt, Service, ServiceBackendPort, ServicePort};

/// Maps a Service's ports to the resources built for them.
///
/// Ingress backends name a Service port either by name or by number; the list
/// resolves both forms to the same backend.
#[derive(Clone, Debug, Default)]
pub struct BackendList {
    namespace: String,
    service: String,
    labels: Vec<String>,
    by_name: HashMap<String, usize>,
    by_number: HashMap<i32, usize>,
}

// === impl BackendList ===

impl BackendList {
    pub fn new(svc: &Service) -> Self {
        let mut list = Self {
            namespace: svc.namespace().unwrap_or_default(),
            service: svc.name_any(),
            ..Default::default()
        };
        for (i, port) in service_ports(svc).iter().enumerate() {
            if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                list.by_name.insert(name.to_string(), i);
            }
            list.by_number.entry(port.port).or_insert(i);
            list.labels.push(port_label(port));
        }
        list
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns the index of the service port a backend refers to.
    pub fn resolve(&self, port: &ServiceBackendPort) -> Option<usize> {
        if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
            return self.by_name.get(name).copied();
        }
        port.number.and_then(|n| self.by_number.get(&n).copied())
    }

    /// The id of the resource built from the service's own port.
    pub fn backend_id(&self, index: usize) -> Option<String> {
        let label = self.labels.get(index)?;
        Some(format!("{}.{}.{}", label, self.service, self.namespace))
    }

    /// The id of the resource built for an ingress rule targeting a port.
    pub fn ingress_id(&self, index: usize, ingress: &str, rule: &str) -> Option<String> {
        let label = self.labels.get(index)?;
        Some(format!(
            "{}.{}.{}-{}.{}",
            label, self.service, ingress, rule, self.namespace
        ))
    }

    /// The id used when the service declares no ports.
    pub fn portless_id(&self) -> String {
        format!("{}.{}", self.service, self.namespace)
    }
}

pub(crate) fn service_ports(svc: &Service) -> &[ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or_default()
}

fn port_label(port: &ServicePort) -> String {
    match port.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => port.port.to_string(),
    }
}
