//! Varnish parameter and systemd unit files.
//!
//! The parameter file is a systemd `EnvironmentFile`; the unit reads it so
//! that a listen or storage change only touches one file.

use cachemgr_common::TopologyKind;

use crate::config::{CacheMgrConfig, DaemonConfig};

/// Daemon process parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonParams {
    /// `-a` listen endpoints.
    pub listen: Vec<String>,
    /// `-T` admin endpoint.
    pub admin: String,
    /// `-S` secret file.
    pub secret: String,
    /// `-f` master configuration.
    pub vcl: String,
    /// `-s malloc,<budget>` storage size.
    pub memory_budget: String,
}

impl DaemonParams {
    /// Parameters for a topology.
    ///
    /// SharedPort keeps the daemon on its internal endpoint; DedicatedPort
    /// binds the public HTTP port on all addresses.
    pub fn for_topology(config: &CacheMgrConfig, topology: TopologyKind, memory_budget: &str) -> Self {
        let listen = match topology {
            TopologyKind::SharedPort => vec![config.daemon.internal_endpoint()],
            TopologyKind::DedicatedPort => vec![format!(":{}", config.origin.public_port)],
        };
        Self {
            listen,
            admin: config.daemon.admin_address.clone(),
            secret: config.daemon.secret_path.clone(),
            vcl: config.daemon.master_config.clone(),
            memory_budget: memory_budget.to_string(),
        }
    }

    /// Renders the environment file.
    pub fn render(&self) -> String {
        format!(
            "# Managed by cachemgrd, local changes are overwritten.\n\
             VARNISH_LISTEN=\"{}\"\n\
             VARNISH_ADMIN=\"{}\"\n\
             VARNISH_SECRET=\"{}\"\n\
             VARNISH_VCL=\"{}\"\n\
             VARNISH_STORAGE=\"malloc,{}\"\n",
            self.listen.join(","),
            self.admin,
            self.secret,
            self.vcl,
            self.memory_budget
        )
    }
}

/// Renders the systemd unit running the daemon with the parameter file.
pub fn render_unit(daemon: &DaemonConfig) -> String {
    format!(
        "# Managed by cachemgrd, local changes are overwritten.\n\
         [Unit]\n\
         Description=Varnish HTTP accelerator (cachemgrd)\n\
         After=network-online.target nss-lookup.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         EnvironmentFile={params}\n\
         ExecStart={binary} -j unix,user=vcache -F -a ${{VARNISH_LISTEN}} -T ${{VARNISH_ADMIN}} -S ${{VARNISH_SECRET}} -f ${{VARNISH_VCL}} -s ${{VARNISH_STORAGE}}\n\
         ExecReload=/usr/sbin/varnishreload\n\
         LimitNOFILE=131072\n\
         LimitMEMLOCK=85983232\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        params = daemon.params_path,
        binary = daemon.binary_path
    )
}
