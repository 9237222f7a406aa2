//! Keyed mutual exclusion.
//!
//! One [`KeyedLocks`] instance serializes whole workflows per site, another
//! serializes edits of a host's master configuration. Guards are owned so
//! they can be held across awaits and release on drop, on every exit path.
//!
//! [`TenancyClaims`] covers the gap between the two: enables of different
//! sites on one host run concurrently, but their topologies must agree.

use cachemgr_common::TopologyKind;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Guard of one key; the lock is released when it is dropped.
pub type KeyGuard = OwnedMutexGuard<()>;

/// Lock manager handing out one async mutex per key
#[derive(Debug)]
pub struct KeyedLocks {
    /// Scope name for logs ("site", "host")
    scope: &'static str,
    /// Lock per key, created on first use
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create new lock manager for a scope
    pub fn new(scope: &'static str) -> Self {
        Self {
            scope,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for and acquires the lock of `key`
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.entry(key);
        debug!(scope = self.scope, key = %key, "Waiting for lock");
        let guard = mutex.lock_owned().await;
        debug!(scope = self.scope, key = %key, "Acquired lock");
        guard
    }

    /// Acquires the lock of `key` if it is free
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Get lock scope
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// True if no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

type ClaimMap = HashMap<String, BTreeMap<String, TopologyKind>>;

/// Topologies claimed by enables still in flight, per host.
///
/// An enable takes the host's gate, checks its topology against recorded
/// state and [`in_flight`](Self::in_flight) claims, then registers its own
/// claim before releasing the gate. The claim lives until the enable has
/// committed or failed.
#[derive(Debug)]
pub struct TenancyClaims {
    gate: KeyedLocks,
    claims: Arc<parking_lot::Mutex<ClaimMap>>,
}

impl Default for TenancyClaims {
    fn default() -> Self {
        Self::new()
    }
}

impl TenancyClaims {
    /// Creates an empty claim table.
    pub fn new() -> Self {
        Self {
            gate: KeyedLocks::new("tenancy"),
            claims: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Serializes topology decisions for one host.
    pub async fn gate(&self, host: &str) -> KeyGuard {
        self.gate.lock(host).await
    }

    /// Claims on `host` by sites other than `except_site`.
    pub fn in_flight(&self, host: &str, except_site: &str) -> Vec<(String, TopologyKind)> {
        self.claims
            .lock()
            .get(host)
            .map(|sites| {
                sites
                    .iter()
                    .filter(|(site, _)| site.as_str() != except_site)
                    .map(|(site, kind)| (site.clone(), *kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers `site` as being enabled on `host` with `kind`.
    pub fn claim(&self, host: &str, site: &str, kind: TopologyKind) -> TenancyClaim {
        self.claims
            .lock()
            .entry(host.to_string())
            .or_default()
            .insert(site.to_string(), kind);
        debug!(host = %host, site = %site, topology = %kind, "Claimed host tenancy");
        TenancyClaim {
            claims: Arc::clone(&self.claims),
            host: host.to_string(),
            site: site.to_string(),
        }
    }
}

/// A registered claim; withdrawn when dropped.
#[derive(Debug)]
#[must_use = "the claim is withdrawn as soon as it is dropped"]
pub struct TenancyClaim {
    claims: Arc<parking_lot::Mutex<ClaimMap>>,
    host: String,
    site: String,
}

impl Drop for TenancyClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock();
        if let Some(sites) = claims.get_mut(&self.host) {
            sites.remove(&self.site);
            if sites.is_empty() {
                claims.remove(&self.host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = KeyedLocks::new("site");
        let guard = locks.lock("shop").await;
        assert!(locks.try_lock("shop").is_none());
        drop(guard);
        assert!(locks.try_lock("shop").is_some());
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = KeyedLocks::new("site");
        let _shop = locks.lock("shop").await;
        let blog = tokio::time::timeout(Duration::from_secs(1), locks.lock("blog")).await;
        assert!(blog.is_ok());
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.scope(), "site");
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(KeyedLocks::new("host"));
        let guard = locks.lock("web1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("web1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_claims_are_visible_until_dropped() {
        let tenancy = TenancyClaims::new();
        let shop = tenancy.claim("web1", "shop", TopologyKind::DedicatedPort);
        let _blog = tenancy.claim("web1", "blog", TopologyKind::SharedPort);
        let _remote = tenancy.claim("web2", "remote", TopologyKind::SharedPort);

        assert_eq!(
            tenancy.in_flight("web1", "example"),
            vec![
                ("blog".to_string(), TopologyKind::SharedPort),
                ("shop".to_string(), TopologyKind::DedicatedPort),
            ]
        );
        assert_eq!(
            tenancy.in_flight("web1", "blog"),
            vec![("shop".to_string(), TopologyKind::DedicatedPort)]
        );

        drop(shop);
        assert_eq!(
            tenancy.in_flight("web1", "example"),
            vec![("blog".to_string(), TopologyKind::SharedPort)]
        );
        assert!(tenancy.in_flight("web3", "example").is_empty());
    }

    #[tokio::test]
    async fn test_gate_is_per_host() {
        let tenancy = TenancyClaims::new();
        let web1 = tenancy.gate("web1").await;

        let mut other_host = task::spawn(tenancy.gate("web2"));
        let _web2 = assert_ready!(other_host.poll());

        let mut same_host = task::spawn(tenancy.gate("web1"));
        assert_pending!(same_host.poll());
        drop(web1);
        assert!(same_host.is_woken());
        let _web1 = assert_ready!(same_host.poll());
    }
}
