//! Configuration file support for cachemgrd
//!
//! Loads and validates cachemgrd configuration from TOML files.
//! Default location: /etc/cachemgrd/cachemgrd.toml
//!
//! Besides the daemon and origin layout of a host, the file carries the
//! host inventory (`[[hosts]]`) and the site catalog (`[[sites]]`) handed
//! over by the site-management system.

use cachemgr_common::{CacheMgrError, CacheMgrResult, Site, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cachemgrd/cachemgrd.toml";

/// Desired-state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding one JSON record per site
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

/// Command channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Timeout for ordinary remote commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Timeout for package installation in seconds
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
}

/// Caching daemon (Varnish) layout on a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// systemd unit name
    #[serde(default = "default_daemon_service")]
    pub service: String,

    /// Binary probed to detect an installation
    #[serde(default = "default_daemon_binary")]
    pub binary: String,

    /// Absolute binary path used by the unit file
    #[serde(default = "default_daemon_binary_path")]
    pub binary_path: String,

    /// Internal listen address under SharedPort topology
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Internal listen port under SharedPort topology
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Administrative interface address (`varnishadm -T`)
    #[serde(default = "default_admin_address")]
    pub admin_address: String,

    /// Administrative secret file (`varnishadm -S`)
    #[serde(default = "default_secret_path")]
    pub secret_path: String,

    /// Master VCL that includes the per-site policies
    #[serde(default = "default_master_config")]
    pub master_config: String,

    /// Directory of per-site policy documents
    #[serde(default = "default_site_policy_dir")]
    pub site_policy_dir: String,

    /// Environment file with listen and storage parameters
    #[serde(default = "default_params_path")]
    pub params_path: String,

    /// systemd unit file
    #[serde(default = "default_unit_path")]
    pub unit_path: String,

    /// Primary installation command
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// Installation command from the alternate package source
    #[serde(default = "default_fallback_install_command")]
    pub fallback_install_command: String,
}

/// Origin server (nginx) layout on a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// systemd unit name
    #[serde(default = "default_origin_service")]
    pub service: String,

    /// Site configuration path; `{domain}` and `{id}` are substituted
    #[serde(default = "default_site_config_template")]
    pub site_config_template: String,

    /// Suffix of the pre-patch backup next to the site configuration
    #[serde(default = "default_backup_suffix")]
    pub backup_suffix: String,

    /// Configuration syntax check
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Application backend the daemon fetches from under SharedPort
    #[serde(default = "default_backend_address")]
    pub backend_address: String,

    /// Public HTTP port
    #[serde(default = "default_public_port")]
    pub public_port: u16,

    /// Public HTTPS port
    #[serde(default = "default_public_tls_port")]
    pub public_tls_port: u16,
}

/// Caching policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// File extensions treated as static assets
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,

    /// TTL for static assets in seconds
    #[serde(default = "default_static_ttl")]
    pub static_ttl_secs: u32,

    /// Addresses allowed to send PURGE/BAN requests
    #[serde(default = "default_purge_acl")]
    pub purge_acl: Vec<String>,
}

/// How a host is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Commands run on this machine
    #[default]
    Local,
    /// Commands run through ssh
    Ssh,
}

/// One managed host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host identifier referenced by sites
    pub id: String,

    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,

    /// ssh destination (`user@host`), required for ssh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// ssh port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// ssh identity file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl HostConfig {
    /// Builds the channel transport for this host.
    pub fn to_transport(&self) -> CacheMgrResult<Transport> {
        match self.transport {
            TransportKind::Local => Ok(Transport::Local),
            TransportKind::Ssh => {
                let destination = self.destination.clone().ok_or_else(|| {
                    CacheMgrError::invalid_config(
                        format!("hosts.{}.destination", self.id),
                        "required for ssh transport",
                    )
                })?;
                Ok(Transport::Ssh {
                    destination,
                    port: self.port,
                    identity: self.identity.clone(),
                })
            }
        }
    }
}

/// Complete cachemgrd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMgrConfig {
    /// Desired-state store
    #[serde(default)]
    pub state: StateConfig,

    /// Command channel
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Caching daemon
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Origin server
    #[serde(default)]
    pub origin: OriginConfig,

    /// Caching policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Managed hosts
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Site catalog
    #[serde(default)]
    pub sites: Vec<Site>,
}

// Default functions
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/cachemgrd")
}

fn default_command_timeout() -> u64 {
    60
}

fn default_install_timeout() -> u64 {
    900
}

fn default_daemon_service() -> String {
    "varnish".to_string()
}

fn default_daemon_binary() -> String {
    "varnishd".to_string()
}

fn default_daemon_binary_path() -> String {
    "/usr/sbin/varnishd".to_string()
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6081
}

fn default_admin_address() -> String {
    "127.0.0.1:6082".to_string()
}

fn default_secret_path() -> String {
    "/etc/varnish/secret".to_string()
}

fn default_master_config() -> String {
    "/etc/varnish/default.vcl".to_string()
}

fn default_site_policy_dir() -> String {
    "/etc/varnish/sites".to_string()
}

fn default_params_path() -> String {
    "/etc/default/varnish".to_string()
}

fn default_unit_path() -> String {
    "/etc/systemd/system/varnish.service".to_string()
}

fn default_install_command() -> String {
    "DEBIAN_FRONTEND=noninteractive apt-get install -y varnish".to_string()
}

fn default_fallback_install_command() -> String {
    "curl -fsSL https://packagecloud.io/install/repositories/varnishcache/varnish60lts/script.deb.sh | bash && DEBIAN_FRONTEND=noninteractive apt-get install -y varnish".to_string()
}

fn default_origin_service() -> String {
    "nginx".to_string()
}

fn default_site_config_template() -> String {
    "/etc/nginx/sites-available/{domain}.conf".to_string()
}

fn default_backup_suffix() -> String {
    ".cachemgrd.bak".to_string()
}

fn default_test_command() -> String {
    "nginx -t".to_string()
}

fn default_backend_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_public_port() -> u16 {
    80
}

fn default_public_tls_port() -> u16 {
    443
}

fn default_static_extensions() -> Vec<String> {
    [
        "css", "js", "png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "woff", "woff2", "ttf",
        "eot", "pdf", "mp4", "webm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_static_ttl() -> u32 {
    86400
}

fn default_purge_acl() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

// Default implementations
impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            install_timeout_secs: default_install_timeout(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            service: default_daemon_service(),
            binary: default_daemon_binary(),
            binary_path: default_daemon_binary_path(),
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            admin_address: default_admin_address(),
            secret_path: default_secret_path(),
            master_config: default_master_config(),
            site_policy_dir: default_site_policy_dir(),
            params_path: default_params_path(),
            unit_path: default_unit_path(),
            install_command: default_install_command(),
            fallback_install_command: default_fallback_install_command(),
        }
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            service: default_origin_service(),
            site_config_template: default_site_config_template(),
            backup_suffix: default_backup_suffix(),
            test_command: default_test_command(),
            backend_address: default_backend_address(),
            public_port: default_public_port(),
            public_tls_port: default_public_tls_port(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            static_extensions: default_static_extensions(),
            static_ttl_secs: default_static_ttl(),
            purge_acl: default_purge_acl(),
        }
    }
}

impl DaemonConfig {
    /// Internal `address:port` the daemon serves on under SharedPort.
    pub fn internal_endpoint(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    /// Per-site policy document path.
    pub fn site_policy_path(&self, site: &Site) -> String {
        format!(
            "{}/{}.vcl",
            self.site_policy_dir.trim_end_matches('/'),
            site.ident()
        )
    }
}

impl OriginConfig {
    /// Site configuration path on the host.
    pub fn site_config_path(&self, site: &Site) -> String {
        self.site_config_template
            .replace("{domain}", &site.domain)
            .replace("{id}", &site.id)
    }

    /// Pre-patch backup path on the host.
    pub fn backup_path(&self, site: &Site) -> String {
        format!("{}{}", self.site_config_path(site), self.backup_suffix)
    }
}

impl CacheMgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> CacheMgrResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                CacheMgrError::invalid_config(path.display().to_string(), e.to_string())
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(CacheMgrError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> CacheMgrResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Parses a TOML document.
    pub fn from_toml(content: &str) -> CacheMgrResult<Self> {
        toml::from_str(content)
            .map_err(|e| CacheMgrError::invalid_config("config", e.to_string()))
    }

    /// Get per-command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.command_timeout_secs)
    }

    /// Get installation timeout as Duration
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.install_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> CacheMgrResult<()> {
        if self.channel.command_timeout_secs == 0 {
            return Err(CacheMgrError::invalid_config(
                "channel.command_timeout_secs",
                "must be > 0",
            ));
        }
        if self.channel.install_timeout_secs < self.channel.command_timeout_secs {
            return Err(CacheMgrError::invalid_config(
                "channel.install_timeout_secs",
                "must not be shorter than command_timeout_secs",
            ));
        }
        if self.daemon.listen_port == 0 {
            return Err(CacheMgrError::invalid_config(
                "daemon.listen_port",
                "must be > 0",
            ));
        }
        if self.origin.public_port == 0 || self.origin.public_tls_port == 0 {
            return Err(CacheMgrError::invalid_config(
                "origin.public_port",
                "public ports must be > 0",
            ));
        }
        if self.origin.public_port == self.daemon.listen_port {
            return Err(CacheMgrError::invalid_config(
                "daemon.listen_port",
                "must differ from the public port",
            ));
        }
        if !self.origin.site_config_template.contains("{domain}")
            && !self.origin.site_config_template.contains("{id}")
        {
            return Err(CacheMgrError::invalid_config(
                "origin.site_config_template",
                "must contain {domain} or {id}",
            ));
        }
        if self.origin.backup_suffix.is_empty() {
            return Err(CacheMgrError::invalid_config(
                "origin.backup_suffix",
                "must not be empty",
            ));
        }
        if self
            .policy
            .static_extensions
            .iter()
            .any(|ext| ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(CacheMgrError::invalid_config(
                "policy.static_extensions",
                "extensions must be non-empty and alphanumeric",
            ));
        }

        let mut host_ids = HashSet::new();
        for host in &self.hosts {
            if !host_ids.insert(host.id.as_str()) {
                return Err(CacheMgrError::invalid_config(
                    "hosts",
                    format!("duplicate host '{}'", host.id),
                ));
            }
            host.to_transport()?;
        }

        let mut site_ids = HashSet::new();
        let mut policy_paths = HashSet::new();
        for site in &self.sites {
            site.validate()?;
            if !site_ids.insert(site.id.as_str()) {
                return Err(CacheMgrError::invalid_config(
                    "sites",
                    format!("duplicate site '{}'", site.id),
                ));
            }
            if !policy_paths.insert((site.host.as_str(), site.ident())) {
                return Err(CacheMgrError::invalid_config(
                    format!("site.{}.id", site.id),
                    "maps to the same policy file as another site on its host",
                ));
            }
            if !host_ids.contains(site.host.as_str()) {
                return Err(CacheMgrError::invalid_config(
                    format!("site.{}.host", site.id),
                    format!("unknown host '{}'", site.host),
                ));
            }
        }

        Ok(())
    }
}
