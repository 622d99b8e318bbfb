use std::collections::BTreeMap;

pub type Annotations = BTreeMap<String, String>;

pub const DEFAULT_PREFIX: &str = "romulus";

pub const HOST: &str = "host";
pub const PATH: &str = "path";
pub const PREFIX: &str = "prefix";
pub const METHODS: &str = "methods";
pub const HEADERS: &str = "headers";
pub const WEBSOCKET: &str = "websocket";
pub const BACKEND_SETTINGS: &str = "backendSettings";
pub const FRONTEND_SETTINGS: &str = "frontendSettings";
pub const BACKEND_TYPE: &str = "backendType";
pub const MIDDLEWARE: &str = "middleware";

/// The annotation namespace owned by this controller, e.g. `romulus/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Keyspace {
    prefix: String,
}

/// Identifies a service port when resolving port-scoped annotations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortScope<'a> {
    pub name: Option<&'a str>,
    pub number: Option<u16>,
}

// === impl Keyspace ===

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl Keyspace {
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the fully-qualified annotation key for `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Qualifies a selector or annotation key that does not already name a
    /// keyspace.
    pub fn qualify(&self, key: &str) -> String {
        if key.contains('/') {
            key.to_string()
        } else {
            self.key(key)
        }
    }

    /// Strips this keyspace from `key`, returning `None` for foreign keys.
    pub fn strip<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix('/')
            .filter(|k| !k.is_empty())
    }

    /// Flattens an object's annotations for a single port.
    ///
    /// Keys outside the keyspace are dropped and the prefix is removed. A key
    /// suffixed with `.<port>` (by name or number) only applies to that port
    /// and takes precedence over its unscoped form; suffixes naming any other
    /// port of the object are discarded.
    pub fn scoped(
        &self,
        annotations: &Annotations,
        port: Option<PortScope<'_>>,
        ports: &[PortScope<'_>],
    ) -> Annotations {
        let mut unscoped = Annotations::new();
        let mut scoped = Annotations::new();

        for (key, value) in annotations {
            let Some(key) = self.strip(key) else {
                continue;
            };

            if let Some((base, scope)) = key.rsplit_once('.') {
                if ports.iter().any(|p| p.matches(scope)) {
                    if port.is_some_and(|p| p.matches(scope)) {
                        scoped.insert(base.to_string(), value.clone());
                    }
                    continue;
                }
            }

            unscoped.insert(key.to_string(), value.clone());
        }

        unscoped.extend(scoped);
        unscoped
    }
}

// === impl PortScope ===

impl<'a> PortScope<'a> {
    pub fn new(name: Option<&'a str>, number: Option<u16>) -> Self {
        Self {
            name: name.filter(|n| !n.is_empty()),
            number,
        }
    }

    fn matches(&self, scope: &str) -> bool {
        if self.name == Some(scope) {
            return true;
        }
        match self.number {
            Some(n) => scope.parse::<u16>().ok() == Some(n),
            None => false,
        }
    }
}

/// Reads a boolean flag from flattened annotations.
pub fn flag(annotations: &Annotations, key: &str) -> bool {
    annotations
        .get(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
        .unwrap_or(false)
}

/// Iterates over `middleware.<id>` definitions in flattened annotations.
pub fn middlewares(annotations: &Annotations) -> impl Iterator<Item = (&str, &str)> {
    annotations.iter().filter_map(|(k, v)| {
        let id = k.strip_prefix(MIDDLEWARE)?.strip_prefix('.')?;
        (!id.is_empty()).then_some((id, v.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn ports() -> Vec<PortScope<'static>> {
        vec![
            PortScope::new(Some("web"), Some(80)),
            PortScope::new(Some("admin"), Some(9990)),
        ]
    }

    #[test]
    fn port_scoped_annotation_wins() {
        let ks = Keyspace::default();
        let anns = btreemap! {
            "romulus/host".to_string() => "a.com".to_string(),
            "romulus/host.web".to_string() => "b.com".to_string(),
        };
        let ports = ports();

        let web = ks.scoped(&anns, Some(ports[0]), &ports);
        assert_eq!(web.get("host").map(String::as_str), Some("b.com"));

        let admin = ks.scoped(&anns, Some(ports[1]), &ports);
        assert_eq!(admin.get("host").map(String::as_str), Some("a.com"));
    }

    #[test]
    fn port_scope_by_number() {
        let ks = Keyspace::default();
        let anns = btreemap! {
            "romulus/path.9990".to_string() => "/admin".to_string(),
        };
        let ports = ports();

        assert_eq!(
            ks.scoped(&anns, Some(ports[1]), &ports).get("path"),
            Some(&"/admin".to_string())
        );
        assert!(ks.scoped(&anns, Some(ports[0]), &ports).is_empty());
    }

    #[test]
    fn foreign_keys_are_dropped() {
        let ks = Keyspace::new("lb.example.com/");
        let anns = btreemap! {
            "romulus/host".to_string() => "a.com".to_string(),
            "lb.example.com/host".to_string() => "b.com".to_string(),
            "lb.example.com/".to_string() => "empty".to_string(),
        };
        let flat = ks.scoped(&anns, None, &[]);
        assert_eq!(flat, btreemap! { "host".to_string() => "b.com".to_string() });
    }

    #[test]
    fn middleware_keys_keep_their_id() {
        let ks = Keyspace::default();
        let anns = btreemap! {
            "romulus/middleware.auth".to_string() => "{}".to_string(),
            "romulus/middleware.rate.web".to_string() => "{\"a\":1}".to_string(),
            "romulus/middleware.rate.admin".to_string() => "{\"a\":2}".to_string(),
        };
        let ports = ports();
        let flat = ks.scoped(&anns, Some(ports[0]), &ports);
        let mws = middlewares(&flat).collect::<Vec<_>>();
        assert_eq!(mws, vec![("auth", "{}"), ("rate", "{\"a\":1}")]);
    }

    #[test]
    fn qualify_adds_prefix() {
        let ks = Keyspace::default();
        assert_eq!(ks.qualify("tier"), "romulus/tier");
        assert_eq!(ks.qualify("app.kubernetes.io/name"), "app.kubernetes.io/name");
    }

    #[test]
    fn flags() {
        let anns = btreemap! {
            "websocket".to_string() => " True ".to_string(),
            "other".to_string() => "no".to_string(),
        };
        assert!(flag(&anns, "websocket"));
        assert!(!flag(&anns, "other"));
        assert!(!flag(&anns, "missing"));
    }
}
