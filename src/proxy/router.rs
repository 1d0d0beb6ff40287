//! Dynamic subdomain -> local-port route table.
//!
//! Owned by the proxy but written by the orchestrator: routes appear when an
//! instance passes its launch grace period and disappear when it stops or
//! crashes. Reads are on the request hot path, so the table is a plain
//! lock-guarded map rather than anything channel-shaped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Clone, Copy)]
struct Route {
    port: u16,
    generation: u64,
}

/// Lock-guarded subdomain -> port map.
///
/// Every `set` stamps the route with a fresh generation, so anything cached
/// against a route (the proxy's upstream connections) can tell a re-published
/// route from the one it was built for, even when the port number repeats.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Route>>,
    epoch: AtomicU64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or replace the route for a subdomain.
    pub fn set(&self, subdomain: &str, port: u16) {
        tracing::info!("Route {} -> 127.0.0.1:{}", subdomain, port);
        let generation = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.routes
            .write()
            .insert(subdomain.to_string(), Route { port, generation });
    }

    /// Withdraw the route for a subdomain. Unknown subdomains are a no-op.
    pub fn unset(&self, subdomain: &str) {
        if self.routes.write().remove(subdomain).is_some() {
            tracing::info!("Route {} withdrawn", subdomain);
        }
    }

    pub fn lookup(&self, subdomain: &str) -> Option<u16> {
        self.routes.read().get(subdomain).map(|r| r.port)
    }

    /// Lookup for the forwarding path: the port plus the generation that
    /// published it.
    pub fn lookup_with_generation(&self, subdomain: &str) -> Option<(u16, u64)> {
        self.routes
            .read()
            .get(subdomain)
            .map(|r| (r.port, r.generation))
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Extract the routing subdomain from a request's Host value.
///
/// `demo.apps.example.com` with base domain `apps.example.com` routes to
/// `demo`. A bare base domain, a host outside the base domain, or a
/// multi-label prefix (`a.b.<base>`) yields None. As a development
/// convenience, `<subdomain>.localhost` is accepted for any base domain.
pub fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    // Strip any port; Host headers carry one for non-default ports.
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let base = base_domain.to_ascii_lowercase();

    let prefix = host
        .strip_suffix(&base)
        .and_then(|p| p.strip_suffix('.'))
        .or_else(|| {
            host.strip_suffix("localhost")
                .and_then(|p| p.strip_suffix('.'))
        })?;

    if prefix.is_empty() || prefix.contains('.') {
        return None;
    }
    Some(prefix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table_set_lookup_unset() {
        let table = RouteTable::new();
        assert!(table.is_empty());

        table.set("demo", 3001);
        assert_eq!(table.lookup("demo"), Some(3001));

        table.set("demo", 3002);
        assert_eq!(table.lookup("demo"), Some(3002));
        assert_eq!(table.len(), 1);

        table.unset("demo");
        assert_eq!(table.lookup("demo"), None);
        // unsetting again is harmless
        table.unset("demo");
    }

    #[test]
    fn test_route_generation_changes_on_every_set() {
        let table = RouteTable::new();
        table.set("demo", 3001);
        let (port, g1) = table.lookup_with_generation("demo").unwrap();
        assert_eq!(port, 3001);

        // A stop/start cycle landing on the same port still reads as a new
        // route, so stale connection caches cannot survive it.
        table.unset("demo");
        assert_eq!(table.lookup_with_generation("demo"), None);
        table.set("demo", 3001);
        let (_, g2) = table.lookup_with_generation("demo").unwrap();
        assert_ne!(g1, g2);

        table.set("demo", 3002);
        let (_, g3) = table.lookup_with_generation("demo").unwrap();
        assert_ne!(g2, g3);
    }

    #[test]
    fn test_extract_subdomain_basic() {
        assert_eq!(
            extract_subdomain("demo.apps.example.com", "apps.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(
            extract_subdomain("demo.apps.example.com:8080", "apps.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(
            extract_subdomain("DEMO.Apps.Example.COM", "apps.example.com"),
            Some("demo".to_string())
        );
    }

    #[test]
    fn test_extract_subdomain_rejects_bad_hosts() {
        // bare base domain
        assert_eq!(extract_subdomain("apps.example.com", "apps.example.com"), None);
        // outside the base domain
        assert_eq!(extract_subdomain("demo.other.com", "apps.example.com"), None);
        // multi-label prefix
        assert_eq!(
            extract_subdomain("a.b.apps.example.com", "apps.example.com"),
            None
        );
        // suffix match without a label boundary
        assert_eq!(
            extract_subdomain("evilapps.example.com", "apps.example.com"),
            None
        );
        assert_eq!(extract_subdomain("", "apps.example.com"), None);
    }

    #[test]
    fn test_extract_subdomain_localhost_convenience() {
        assert_eq!(
            extract_subdomain("demo.localhost", "apps.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(
            extract_subdomain("demo.localhost:8080", "apps.example.com"),
            Some("demo".to_string())
        );
        assert_eq!(extract_subdomain("localhost", "apps.example.com"), None);
    }
}
