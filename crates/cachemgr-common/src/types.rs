//! Domain types shared by the cachemgr crates.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheMgrError, CacheMgrResult};

/// Offset added to the internal backend port for the origin's TLS listener.
pub const TLS_PORT_OFFSET: u16 = 363;

/// Lowest accepted internal backend port (first registered port).
pub const MIN_BACKEND_PORT: u16 = 1024;

/// Highest accepted internal backend port; leaves room for the TLS offset.
pub const MAX_BACKEND_PORT: u16 = u16::MAX - TLS_PORT_OFFSET;

static MEMORY_BUDGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9][0-9]*[KMGTkmgt]$").expect("Invalid regex pattern"));

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*\.)?[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)*$")
        .expect("Invalid regex pattern")
});

/// One tenant web property on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Stable identifier.
    pub id: String,
    /// Host the site lives on.
    pub host: String,
    /// Primary domain name.
    pub domain: String,
    /// Alias domain names.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Site {
    /// Creates a site without aliases.
    pub fn new(id: impl Into<String>, host: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            domain: domain.into(),
            aliases: Vec::new(),
        }
    }

    /// Adds an alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Primary domain followed by aliases, duplicates removed, order kept.
    pub fn hostnames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(1 + self.aliases.len());
        for name in std::iter::once(&self.domain).chain(self.aliases.iter()) {
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }
        names
    }

    /// Identifier safe for use in file names and VCL symbols.
    pub fn ident(&self) -> String {
        self.id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Validates identifier and hostnames.
    pub fn validate(&self) -> CacheMgrResult<()> {
        if self.id.trim().is_empty() {
            return Err(CacheMgrError::invalid_config("site.id", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(CacheMgrError::invalid_config(
                format!("site.{}.host", self.id),
                "must not be empty",
            ));
        }
        for name in self.hostnames() {
            if !HOSTNAME_RE.is_match(name) {
                return Err(CacheMgrError::invalid_config(
                    format!("site.{}.domain", self.id),
                    format!("'{}' is not a valid hostname", name),
                ));
            }
        }
        Ok(())
    }
}

/// Which service binds the public ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// Daemon on an internal port; origin keeps the public ports and proxies.
    SharedPort,
    /// Daemon on the public ports; origin moves to an internal port.
    DedicatedPort,
}

impl TopologyKind {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::SharedPort => "shared_port",
            TopologyKind::DedicatedPort => "dedicated_port",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = CacheMgrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" | "shared_port" | "shared-port" => Ok(TopologyKind::SharedPort),
            "dedicated" | "dedicated_port" | "dedicated-port" => Ok(TopologyKind::DedicatedPort),
            other => Err(CacheMgrError::invalid_config(
                "topology",
                format!("unknown topology '{}'", other),
            )),
        }
    }
}

/// Topology with its port; the backend port exists only under DedicatedPort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Daemon on an internal port.
    SharedPort,
    /// Daemon on the public ports, origin relocated to `backend_port`.
    DedicatedPort {
        /// Internal port the origin server listens on.
        backend_port: u16,
    },
}

impl Topology {
    /// Returns the topology kind.
    pub fn kind(&self) -> TopologyKind {
        match self {
            Topology::SharedPort => TopologyKind::SharedPort,
            Topology::DedicatedPort { .. } => TopologyKind::DedicatedPort,
        }
    }

    /// Returns the backend port, set only under DedicatedPort.
    pub fn backend_port(&self) -> Option<u16> {
        match self {
            Topology::SharedPort => None,
            Topology::DedicatedPort { backend_port } => Some(*backend_port),
        }
    }
}

/// Parameters of an enabled cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheParams {
    /// Default object TTL in seconds.
    pub ttl_seconds: u32,
    /// Daemon memory budget with unit, e.g. "256M".
    pub memory_budget: String,
    /// Port topology.
    pub topology: Topology,
}

/// Desired caching state of one site.
///
/// `params` is retained after disable for audit and is ignored while
/// `enabled` is false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CacheStateRecord", into = "CacheStateRecord")]
pub struct CacheState {
    /// Whether caching is enabled.
    pub enabled: bool,
    /// Parameters of the last enable.
    pub params: Option<CacheParams>,
}

impl CacheState {
    /// State of an enabled cache.
    pub fn enabled(params: CacheParams) -> Self {
        Self {
            enabled: true,
            params: Some(params),
        }
    }

    /// Disabled state keeping the previous parameters for audit.
    pub fn disabled_from(previous: &CacheState) -> Self {
        Self {
            enabled: false,
            params: previous.params.clone(),
        }
    }

    /// Parameters in effect, `None` while disabled.
    pub fn active_params(&self) -> Option<&CacheParams> {
        if self.enabled {
            self.params.as_ref()
        } else {
            None
        }
    }

    /// Topology in effect, `None` while disabled.
    pub fn active_topology(&self) -> Option<Topology> {
        self.active_params().map(|p| p.topology)
    }
}

/// Flat stored form of [`CacheState`]; decoding validates the invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheStateRecord {
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_budget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topology: Option<TopologyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend_port: Option<u16>,
}

impl From<CacheState> for CacheStateRecord {
    fn from(state: CacheState) -> Self {
        match state.params {
            Some(params) => Self {
                enabled: state.enabled,
                ttl_seconds: Some(params.ttl_seconds),
                memory_budget: Some(params.memory_budget),
                topology: Some(params.topology.kind()),
                backend_port: params.topology.backend_port(),
            },
            None => Self {
                enabled: state.enabled,
                ttl_seconds: None,
                memory_budget: None,
                topology: None,
                backend_port: None,
            },
        }
    }
}

impl TryFrom<CacheStateRecord> for CacheState {
    type Error = String;

    fn try_from(record: CacheStateRecord) -> Result<Self, Self::Error> {
        let params = match (record.ttl_seconds, record.memory_budget, record.topology) {
            (None, None, None) => {
                if record.backend_port.is_some() {
                    return Err("backend_port set without topology".to_string());
                }
                None
            }
            (Some(ttl_seconds), Some(memory_budget), Some(kind)) => {
                let topology = match (kind, record.backend_port) {
                    (TopologyKind::SharedPort, None) => Topology::SharedPort,
                    (TopologyKind::DedicatedPort, Some(backend_port)) => {
                        Topology::DedicatedPort { backend_port }
                    }
                    (TopologyKind::SharedPort, Some(_)) => {
                        return Err("backend_port is only valid for dedicated_port".to_string())
                    }
                    (TopologyKind::DedicatedPort, None) => {
                        return Err("dedicated_port requires backend_port".to_string())
                    }
                };
                Some(CacheParams {
                    ttl_seconds,
                    memory_budget,
                    topology,
                })
            }
            _ => return Err("incomplete cache parameters".to_string()),
        };

        if record.enabled && params.is_none() {
            return Err("enabled state without parameters".to_string());
        }

        Ok(CacheState {
            enabled: record.enabled,
            params,
        })
    }
}

/// Caller-supplied Enable parameters, validated into [`CacheParams`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableRequest {
    /// Default object TTL in seconds.
    pub ttl_seconds: u32,
    /// Memory budget with unit.
    pub memory_budget: String,
    /// Requested topology.
    pub topology: TopologyKind,
    /// Internal origin port, required iff DedicatedPort.
    pub backend_port: Option<u16>,
}

impl EnableRequest {
    /// Shared-port request.
    pub fn shared(ttl_seconds: u32, memory_budget: impl Into<String>) -> Self {
        Self {
            ttl_seconds,
            memory_budget: memory_budget.into(),
            topology: TopologyKind::SharedPort,
            backend_port: None,
        }
    }

    /// Dedicated-port request.
    pub fn dedicated(ttl_seconds: u32, memory_budget: impl Into<String>, backend_port: u16) -> Self {
        Self {
            ttl_seconds,
            memory_budget: memory_budget.into(),
            topology: TopologyKind::DedicatedPort,
            backend_port: Some(backend_port),
        }
    }

    /// Validates the request.
    pub fn validate(&self) -> CacheMgrResult<CacheParams> {
        if !MEMORY_BUDGET_RE.is_match(&self.memory_budget) {
            return Err(CacheMgrError::invalid_config(
                "memory_budget",
                format!(
                    "'{}' is not a size such as 256M or 2G",
                    self.memory_budget
                ),
            ));
        }

        let topology = match (self.topology, self.backend_port) {
            (TopologyKind::SharedPort, None) => Topology::SharedPort,
            (TopologyKind::SharedPort, Some(_)) => {
                return Err(CacheMgrError::invalid_config(
                    "backend_port",
                    "only valid with dedicated_port topology",
                ))
            }
            (TopologyKind::DedicatedPort, None) => {
                return Err(CacheMgrError::invalid_config(
                    "backend_port",
                    "required with dedicated_port topology",
                ))
            }
            (TopologyKind::DedicatedPort, Some(port)) => {
                if !(MIN_BACKEND_PORT..=MAX_BACKEND_PORT).contains(&port) {
                    return Err(CacheMgrError::invalid_config(
                        "backend_port",
                        format!(
                            "{} outside {}..={}",
                            port, MIN_BACKEND_PORT, MAX_BACKEND_PORT
                        ),
                    ));
                }
                Topology::DedicatedPort { backend_port: port }
            }
        };

        Ok(CacheParams {
            ttl_seconds: self.ttl_seconds,
            memory_budget: self.memory_budget.to_ascii_uppercase(),
            topology,
        })
    }
}

/// Purge scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeMode {
    /// Everything cached for the site's hostnames.
    All,
    /// Paths matching a regular expression in the daemon's dialect.
    Pattern(String),
    /// Exactly one path.
    Single(String),
}

impl PurgeMode {
    /// Short name for logs and step names.
    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeMode::All => "all",
            PurgeMode::Pattern(_) => "pattern",
            PurgeMode::Single(_) => "single",
        }
    }
}

/// Normalizes a purge path so it begins with `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(ttl: u32) -> CacheParams {
        CacheParams {
            ttl_seconds: ttl,
            memory_budget: "256M".to_string(),
            topology: Topology::SharedPort,
        }
    }

    #[test]
    fn test_site_hostnames_dedup() {
        let site = Site::new("shop", "web1", "example.com")
            .with_alias("www.example.com")
            .with_alias("example.com");
        assert_eq!(site.hostnames(), vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_site_ident() {
        let site = Site::new("Shop-01.eu", "web1", "example.com");
        assert_eq!(site.ident(), "shop_01_eu");
    }

    #[test]
    fn test_site_validate() {
        assert!(Site::new("shop", "web1", "example.com").validate().is_ok());
        assert!(Site::new("shop", "web1", "bad host").validate().is_err());
        assert!(Site::new("", "web1", "example.com").validate().is_err());
        assert!(Site::new("shop", "web1", "example.com")
            .with_alias("*.example.com")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_topology_kind_from_str() {
        assert_eq!(
            "shared".parse::<TopologyKind>().unwrap(),
            TopologyKind::SharedPort
        );
        assert_eq!(
            "dedicated_port".parse::<TopologyKind>().unwrap(),
            TopologyKind::DedicatedPort
        );
        assert!("bogus".parse::<TopologyKind>().is_err());
    }

    #[test]
    fn test_enable_request_validation() {
        let params = EnableRequest::shared(300, "256m").validate().unwrap();
        assert_eq!(params.memory_budget, "256M");
        assert_eq!(params.topology, Topology::SharedPort);

        let params = EnableRequest::dedicated(60, "1G", 8080).validate().unwrap();
        assert_eq!(params.topology.backend_port(), Some(8080));

        assert!(EnableRequest::shared(300, "lots").validate().is_err());
        assert!(EnableRequest::shared(300, "0M").validate().is_err());
        // A bare number would be read as bytes by varnishd.
        assert!(EnableRequest::shared(300, "256").validate().is_err());
        assert!(EnableRequest::dedicated(60, "1G", 80).validate().is_err());
        assert!(EnableRequest::dedicated(60, "1G", 65500).validate().is_err());

        let mut missing_port = EnableRequest::dedicated(60, "1G", 8080);
        missing_port.backend_port = None;
        assert!(missing_port.validate().is_err());

        let mut stray_port = EnableRequest::shared(60, "1G");
        stray_port.backend_port = Some(8080);
        assert!(stray_port.validate().is_err());
    }

    #[test]
    fn test_cache_state_serde_roundtrip() {
        let states = [
            CacheState::default(),
            CacheState::enabled(shared(300)),
            CacheState::enabled(CacheParams {
                ttl_seconds: 0,
                memory_budget: "1G".to_string(),
                topology: Topology::DedicatedPort { backend_port: 8080 },
            }),
            CacheState::disabled_from(&CacheState::enabled(shared(120))),
        ];
        for state in states {
            let json = serde_json::to_string(&state).unwrap();
            let decoded: CacheState = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, state);
        }
    }

    #[test]
    fn test_cache_state_rejects_broken_records() {
        let cases = [
            r#"{"enabled":true}"#,
            r#"{"enabled":false,"backend_port":8080}"#,
            r#"{"enabled":true,"ttl_seconds":1,"memory_budget":"1M","topology":"dedicated_port"}"#,
            r#"{"enabled":true,"ttl_seconds":1,"memory_budget":"1M","topology":"shared_port","backend_port":1}"#,
            r#"{"enabled":true,"ttl_seconds":1,"topology":"shared_port"}"#,
        ];
        for case in cases {
            assert!(
                serde_json::from_str::<CacheState>(case).is_err(),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_disabled_state_ignores_params() {
        let state = CacheState::disabled_from(&CacheState::enabled(shared(300)));
        assert!(!state.enabled);
        assert!(state.params.is_some());
        assert!(state.active_params().is_none());
        assert!(state.active_topology().is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("index.html"), "/index.html");
        assert_eq!(normalize_path("/a/b?c=1"), "/a/b?c=1");
        assert_eq!(normalize_path(""), "/");
    }
}
