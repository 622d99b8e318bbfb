use crate::{annotations::Annotations, route::Route};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// The number of hex characters kept from a server's content digest.
pub const SERVER_ID_LEN: usize = 16;

const FULL_DIGEST_LEN: usize = 64;

/// A routable unit: one service port's route and server pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub id: String,
    pub uid: Option<String>,
    pub route: Route,
    pub annotations: Annotations,
    pub servers: Vec<Server>,
    pub websocket: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Server {
    pub id: String,
    pub scheme: Scheme,
    pub ip: IpAddr,
    pub port: u16,
    pub websocket: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scheme {
    #[default]
    Http,
    Ws,
    Wss,
}

/// Computes a content-addressed server id.
///
/// The id only depends on the owning resource and the server's address, so
/// rebuilding an unchanged server always yields the same id.
pub fn server_id(resource_id: &str, ip: IpAddr, port: u16, len: usize) -> String {
    let digest = Sha256::new()
        .chain_update(resource_id.as_bytes())
        .chain_update(b"|")
        .chain_update(ip.to_string().as_bytes())
        .chain_update(b"|")
        .chain_update(port.to_string().as_bytes())
        .finalize();
    let mut id = hex::encode(digest);
    id.truncate(len.clamp(1, FULL_DIGEST_LEN));
    id
}

// === impl Resource ===

impl Resource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uid: None,
            route: Route::default(),
            annotations: Annotations::default(),
            servers: Vec::new(),
            websocket: false,
        }
    }

    /// Adds a server to the pool.
    ///
    /// A server with the same address as an existing one is ignored. Callers
    /// should add servers in a stable order so that collision handling is
    /// deterministic across builds.
    pub fn add_server(&mut self, scheme: Scheme, ip: IpAddr, port: u16) {
        self.add_server_with_id_len(scheme, ip, port, SERVER_ID_LEN)
    }

    pub(crate) fn add_server_with_id_len(
        &mut self,
        scheme: Scheme,
        ip: IpAddr,
        port: u16,
        len: usize,
    ) {
        if self.servers.iter().any(|s| s.ip == ip && s.port == port) {
            return;
        }

        let mut id = server_id(&self.id, ip, port, len);
        if let Some(existing) = self.servers.iter().find(|s| s.id == id) {
            tracing::warn!(
                resource = %self.id,
                %id,
                existing = %existing.addr(),
                addr = %SocketAddr::new(ip, port),
                "Server id collision",
            );
            id = server_id(&self.id, ip, port, FULL_DIGEST_LEN);
        }

        self.servers.push(Server {
            id,
            scheme,
            ip,
            port,
            websocket: self.websocket || scheme.is_websocket(),
        });
    }
}

// === impl Server ===

impl Server {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The scheme the load balancer dials. Websocket servers declared with a
    /// plain `http` backend type are dialed as `ws`.
    pub fn dial_scheme(&self) -> Scheme {
        match self.scheme {
            Scheme::Http if self.websocket => Scheme::Ws,
            scheme => scheme,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.dial_scheme(), self.addr())
    }
}

// === impl Scheme ===

impl Scheme {
    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            s => anyhow::bail!("invalid backend type: {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn server_id_is_stable() {
        let a = server_id("web.foo.ns", ip("10.0.0.5"), 80, SERVER_ID_LEN);
        let b = server_id("web.foo.ns", ip("10.0.0.5"), 80, SERVER_ID_LEN);
        assert_eq!(a, b);
        assert_eq!(a.len(), SERVER_ID_LEN);
    }

    #[test]
    fn server_id_changes_with_address() {
        let base = server_id("web.foo.ns", ip("10.0.0.5"), 80, SERVER_ID_LEN);
        assert_ne!(base, server_id("web.foo.ns", ip("10.0.0.6"), 80, SERVER_ID_LEN));
        assert_ne!(base, server_id("web.foo.ns", ip("10.0.0.5"), 81, SERVER_ID_LEN));
        assert_ne!(base, server_id("api.foo.ns", ip("10.0.0.5"), 80, SERVER_ID_LEN));
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let mut r = Resource::new("web.foo.ns");
        r.add_server(Scheme::Http, ip("10.0.0.5"), 80);
        r.add_server(Scheme::Http, ip("10.0.0.5"), 80);
        assert_eq!(r.servers.len(), 1);
    }

    #[test]
    fn truncated_collisions_are_disambiguated() {
        // With a single hex character there are only 16 possible ids, so 40
        // distinct addresses are guaranteed to collide.
        let mut r = Resource::new("web.foo.ns");
        for i in 0..40u8 {
            r.add_server_with_id_len(Scheme::Http, IpAddr::from([10, 0, 0, i]), 80, 1);
        }
        assert_eq!(r.servers.len(), 40);
        let ids = r.servers.iter().map(|s| s.id.as_str()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 40, "server ids must be unique");
        assert!(r.servers.iter().any(|s| s.id.len() == FULL_DIGEST_LEN));
    }

    #[test]
    fn ipv6_url() {
        let mut r = Resource::new("web.foo.ns");
        r.add_server(Scheme::Ws, ip("fd00::1"), 8080);
        assert_eq!(r.servers[0].url(), "ws://[fd00::1]:8080");
        assert!(r.servers[0].websocket);
    }

    #[test]
    fn websocket_servers_dial_ws() {
        let mut r = Resource::new("web.foo.ns");
        r.websocket = true;
        r.add_server(Scheme::Http, ip("10.0.0.5"), 8080);
        r.add_server(Scheme::Wss, ip("10.0.0.6"), 8443);
        assert_eq!(r.servers[0].url(), "ws://10.0.0.5:8080");
        assert_eq!(r.servers[1].url(), "wss://10.0.0.6:8443");

        let mut r = Resource::new("web.foo.ns");
        r.add_server(Scheme::Http, ip("10.0.0.5"), 8080);
        assert_eq!(r.servers[0].url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn parse_scheme() {
        assert_eq!("WSS".parse::<Scheme>().unwrap(), Scheme::Wss);
        assert!("tcp".parse::<Scheme>().is_err());
    }
}
