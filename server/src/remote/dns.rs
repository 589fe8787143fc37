//! DNS cache for the relay hostname.
//!
//! Fresh lookups are held as *pending* until a connection made with them
//! authenticates; only then are they promoted to *validated* and persisted.
//! When a lookup fails (or times out) the validated set is served instead,
//! which keeps the device reaching the relay through flaky resolvers and
//! captive-portal style DNS interception.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::util::{read_json, write_json};

/// Result of [`DnsCache::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub addrs: Vec<IpAddr>,
    /// Served from the validated cache because the lookup failed.
    pub from_cache: bool,
}

impl Resolved {
    /// Random candidate, spreading load over multiple relay addresses.
    pub fn pick(&self) -> Option<IpAddr> {
        self.addrs.choose(&mut rand::thread_rng()).copied()
    }
}

#[derive(Debug)]
pub struct DnsCache {
    path: PathBuf,
    validated: HashMap<String, Vec<IpAddr>>,
    pending: HashMap<String, Vec<IpAddr>>,
}

impl DnsCache {
    pub async fn load(path: &Path) -> Self {
        let validated = match read_json(path).await {
            Ok(Some(v)) => v,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("DNS: ignoring cache: {e}");
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            validated,
            pending: HashMap::new(),
        }
    }

    /// Look up `host`, falling back to the validated cache on failure.
    pub async fn resolve(&mut self, host: &str, timeout: Duration) -> Result<Resolved, String> {
        let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await;
        let fresh: Result<Vec<IpAddr>, String> = match lookup {
            Ok(Ok(addrs)) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort_unstable();
                ips.dedup();
                if ips.is_empty() {
                    Err("no addresses".to_string())
                } else {
                    Ok(ips)
                }
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("lookup timed out".to_string()),
        };
        self.accept_lookup(host, fresh)
    }

    fn accept_lookup(
        &mut self,
        host: &str,
        fresh: Result<Vec<IpAddr>, String>,
    ) -> Result<Resolved, String> {
        match fresh {
            Ok(addrs) => {
                self.pending.insert(host.to_string(), addrs.clone());
                Ok(Resolved {
                    addrs,
                    from_cache: false,
                })
            }
            Err(e) => match self.validated.get(host) {
                Some(addrs) if !addrs.is_empty() => {
                    info!("DNS: lookup for {host} failed ({e}), using cached addresses");
                    Ok(Resolved {
                        addrs: addrs.clone(),
                        from_cache: true,
                    })
                }
                _ => Err(format!("lookup for {host} failed: {e}")),
            },
        }
    }

    /// Promote the pending result for `host` after a successful handshake.
    pub async fn validate(&mut self, host: &str) {
        let Some(addrs) = self.pending.remove(host) else {
            return;
        };
        if self.validated.get(host) == Some(&addrs) {
            return;
        }
        debug!("DNS: validated {host} -> {addrs:?}");
        self.validated.insert(host.to_string(), addrs);
        if let Err(e) = write_json(&self.path, &self.validated).await {
            warn!("DNS: saving cache failed: {e}");
        }
    }

    pub fn validated(&self, host: &str) -> Option<&[IpAddr]> {
        self.validated.get(host).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_fresh_result_pending_until_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_cache.json");
        let mut cache = DnsCache::load(&path).await;

        let r = cache
            .accept_lookup("relay.example.net", Ok(vec![ip("192.0.2.1")]))
            .unwrap();
        assert!(!r.from_cache);
        assert!(cache.validated("relay.example.net").is_none());
        assert!(!path.exists());

        cache.validate("relay.example.net").await;
        assert_eq!(cache.validated("relay.example.net").unwrap(), [ip("192.0.2.1")]);

        let reloaded = DnsCache::load(&path).await;
        assert_eq!(reloaded.validated("relay.example.net").unwrap(), [ip("192.0.2.1")]);
    }

    #[tokio::test]
    async fn test_failed_lookup_serves_validated() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DnsCache::load(&dir.path().join("dns_cache.json")).await;
        assert!(cache
            .accept_lookup("relay.example.net", Err("SERVFAIL".into()))
            .is_err());

        cache
            .accept_lookup(
                "relay.example.net",
                Ok(vec![ip("192.0.2.1"), ip("192.0.2.2")]),
            )
            .unwrap();
        cache.validate("relay.example.net").await;

        let r = cache
            .accept_lookup("relay.example.net", Err("SERVFAIL".into()))
            .unwrap();
        assert!(r.from_cache);
        assert!(r.addrs.contains(&r.pick().unwrap()));
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DnsCache::load(&dir.path().join("dns_cache.json")).await;
        let r = cache
            .resolve("localhost", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!r.from_cache);
        assert!(r.addrs.iter().all(IpAddr::is_loopback));
    }
}
