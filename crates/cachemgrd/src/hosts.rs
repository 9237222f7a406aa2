//! Host registry: host id to command channel.

use cachemgr_common::{CacheMgrError, CacheMgrResult, CommandChannel, ShellChannel};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::HostConfig;

/// Channels of all managed hosts.
#[derive(Clone, Default)]
pub struct HostRegistry {
    channels: BTreeMap<String, Arc<dyn CommandChannel>>,
}

impl HostRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds shell channels for configured hosts.
    pub fn from_config(hosts: &[HostConfig]) -> CacheMgrResult<Self> {
        let mut registry = Self::new();
        for host in hosts {
            let channel = ShellChannel::new(host.id.clone(), host.to_transport()?);
            registry.register(host.id.clone(), Arc::new(channel));
        }
        Ok(registry)
    }

    /// Registers or replaces the channel of a host.
    pub fn register(&mut self, host: impl Into<String>, channel: Arc<dyn CommandChannel>) {
        self.channels.insert(host.into(), channel);
    }

    /// Channel of `host`.
    pub fn channel(&self, host: &str) -> CacheMgrResult<Arc<dyn CommandChannel>> {
        self.channels
            .get(host)
            .cloned()
            .ok_or_else(|| CacheMgrError::host_not_found(host))
    }

    /// True if `host` is registered.
    pub fn contains(&self, host: &str) -> bool {
        self.channels.contains_key(host)
    }

    /// Registered host ids in order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("hosts", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    #[test]
    fn test_from_config() {
        let registry = HostRegistry::from_config(&[
            HostConfig {
                id: "web1".to_string(),
                transport: TransportKind::Local,
                destination: None,
                port: None,
                identity: None,
            },
            HostConfig {
                id: "web2".to_string(),
                transport: TransportKind::Ssh,
                destination: Some("root@web2.example.net".to_string()),
                port: None,
                identity: None,
            },
        ])
        .unwrap();

        assert_eq!(registry.hosts().collect::<Vec<_>>(), vec!["web1", "web2"]);
        assert_eq!(registry.channel("web2").unwrap().host(), "web2");
        assert!(registry.contains("web1"));
    }

    #[test]
    fn test_unknown_host() {
        let registry = HostRegistry::new();
        assert!(matches!(
            registry.channel("web9"),
            Err(CacheMgrError::HostNotFound { .. })
        ));
    }
}
