//! Caching policy rendering.
//!
//! A site's policy is a VCL fragment included from the daemon's master
//! configuration. Every subroutine in it is guarded by the site's
//! host-match condition, so fragments of different tenants can be
//! concatenated by Varnish without affecting each other.
//!
//! Rendering is a pure function of its input: the idempotency probe of
//! the policy step compares the rendered text with the deployed file.

use cachemgr_common::{CacheMgrError, CacheMgrResult, Site};
use std::fmt::Write as _;

use crate::config::PolicyConfig;

/// Inputs of one policy document.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput<'a> {
    /// Site the policy is for.
    pub site: &'a Site,
    /// Default object TTL in seconds.
    pub ttl_seconds: u32,
    /// `host:port` the daemon fetches this site from.
    pub backend: &'a str,
}

/// Renders per-site policy documents and origin proxy fragments.
pub trait PolicyRenderer: Send + Sync {
    /// Renders the site's policy document.
    fn render(&self, input: &PolicyInput<'_>) -> CacheMgrResult<String>;

    /// Renders the origin-server fragment that routes public traffic
    /// through the daemon at `cache_endpoint`.
    fn render_proxy_block(&self, cache_endpoint: &str) -> String;
}

/// Condition matching a request against a site's hostnames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatch<'a> {
    names: Vec<&'a str>,
}

impl<'a> HostMatch<'a> {
    /// Primary domain plus aliases.
    pub fn new(site: &'a Site) -> Self {
        Self {
            names: site.hostnames(),
        }
    }

    /// Renders the condition against `subject`, one clause per hostname
    /// joined by `||`. Wildcard aliases (`*.example.com`) become a regex
    /// match on a single label.
    pub fn condition(&self, subject: &str) -> String {
        self.names
            .iter()
            .map(|name| match name.strip_prefix("*.") {
                Some(rest) => format!(
                    "{} ~ \"^[^.]+[.]{}$\"",
                    subject,
                    rest.replace('.', "[.]")
                ),
                None => format!("{} == \"{}\"", subject, name),
            })
            .collect::<Vec<_>>()
            .join(" || ")
    }
}

/// Varnish policy renderer.
#[derive(Debug, Clone)]
pub struct VclRenderer {
    static_extensions: Vec<String>,
    static_ttl_secs: u32,
    purge_acl: Vec<String>,
}

impl VclRenderer {
    /// Creates a renderer from policy configuration.
    pub fn new(config: &PolicyConfig) -> Self {
        let mut static_extensions: Vec<String> = config
            .static_extensions
            .iter()
            .map(|e| e.to_ascii_lowercase())
            .collect();
        static_extensions.sort();
        static_extensions.dedup();
        Self {
            static_extensions,
            static_ttl_secs: config.static_ttl_secs,
            purge_acl: config.purge_acl.clone(),
        }
    }

    fn static_asset_match(&self, subject: &str) -> Option<String> {
        if self.static_extensions.is_empty() {
            return None;
        }
        Some(format!(
            "{} ~ \"(?i)\\.({})(\\?.*)?$\"",
            subject,
            self.static_extensions.join("|")
        ))
    }
}

impl Default for VclRenderer {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_backend(backend: &str) -> CacheMgrResult<(&str, u16)> {
    let invalid = || {
        CacheMgrError::invalid_config("backend", format!("'{}' is not host:port", backend))
    };
    let (host, port) = backend.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host, port))
}

impl PolicyRenderer for VclRenderer {
    fn render(&self, input: &PolicyInput<'_>) -> CacheMgrResult<String> {
        let site = input.site;
        let ident = site.ident();
        let (backend_host, backend_port) = split_backend(input.backend)?;
        let hosts = HostMatch::new(site);
        let recv_match = hosts.condition("req.http.host");
        let backend_match = hosts.condition("bereq.http.host");

        let mut vcl = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(
            vcl,
            "# cachemgrd policy for site {} ({})",
            site.id,
            site.hostnames().join(" ")
        );
        let _ = writeln!(vcl, "# Generated file, local changes are overwritten.");
        let _ = writeln!(vcl);

        let _ = writeln!(vcl, "backend site_{} {{", ident);
        let _ = writeln!(vcl, "    .host = \"{}\";", backend_host);
        let _ = writeln!(vcl, "    .port = \"{}\";", backend_port);
        let _ = writeln!(vcl, "}}");
        let _ = writeln!(vcl);

        let _ = writeln!(vcl, "acl purge_{} {{", ident);
        for entry in &self.purge_acl {
            let _ = writeln!(vcl, "    \"{}\";", entry);
        }
        let _ = writeln!(vcl, "}}");
        let _ = writeln!(vcl);

        let _ = writeln!(vcl, "sub vcl_recv {{");
        let _ = writeln!(vcl, "    if ({}) {{", recv_match);
        let _ = writeln!(vcl, "        set req.backend_hint = site_{};", ident);
        let _ = writeln!(vcl);
        let _ = writeln!(vcl, "        if (req.method == \"PURGE\") {{");
        let _ = writeln!(vcl, "            if (client.ip !~ purge_{}) {{", ident);
        let _ = writeln!(vcl, "                return (synth(405, \"Not allowed\"));");
        let _ = writeln!(vcl, "            }}");
        let _ = writeln!(vcl, "            return (purge);");
        let _ = writeln!(vcl, "        }}");
        let _ = writeln!(vcl, "        if (req.method == \"BAN\") {{");
        let _ = writeln!(vcl, "            if (client.ip !~ purge_{}) {{", ident);
        let _ = writeln!(vcl, "                return (synth(405, \"Not allowed\"));");
        let _ = writeln!(vcl, "            }}");
        let _ = writeln!(vcl, "            if (req.http.X-Ban-Url) {{");
        let _ = writeln!(
            vcl,
            "                ban(\"req.http.host == \" + req.http.host + \" && req.url ~ \" + req.http.X-Ban-Url);"
        );
        let _ = writeln!(vcl, "            }} else {{");
        let _ = writeln!(vcl, "                ban(\"req.http.host == \" + req.http.host);");
        let _ = writeln!(vcl, "            }}");
        let _ = writeln!(vcl, "            return (synth(200, \"Banned\"));");
        let _ = writeln!(vcl, "        }}");
        let _ = writeln!(vcl);
        let _ = writeln!(
            vcl,
            "        if (req.method != \"GET\" && req.method != \"HEAD\") {{"
        );
        let _ = writeln!(vcl, "            return (pass);");
        let _ = writeln!(vcl, "        }}");
        let _ = writeln!(vcl, "        if (req.http.Authorization) {{");
        let _ = writeln!(vcl, "            return (pass);");
        let _ = writeln!(vcl, "        }}");
        if let Some(static_match) = self.static_asset_match("req.url") {
            let _ = writeln!(vcl, "        if ({}) {{", static_match);
            let _ = writeln!(vcl, "            unset req.http.Cookie;");
            let _ = writeln!(vcl, "            return (hash);");
            let _ = writeln!(vcl, "        }}");
        }
        let _ = writeln!(vcl, "        if (req.http.Cookie) {{");
        let _ = writeln!(vcl, "            return (pass);");
        let _ = writeln!(vcl, "        }}");
        let _ = writeln!(vcl, "        return (hash);");
        let _ = writeln!(vcl, "    }}");
        let _ = writeln!(vcl, "}}");
        let _ = writeln!(vcl);

        let _ = writeln!(vcl, "sub vcl_backend_response {{");
        let _ = writeln!(vcl, "    if ({}) {{", backend_match);
        let _ = writeln!(vcl, "        if (beresp.status >= 400) {{");
        let _ = writeln!(vcl, "            set beresp.ttl = 0s;");
        let _ = writeln!(vcl, "            set beresp.uncacheable = true;");
        let _ = writeln!(vcl, "            return (deliver);");
        let _ = writeln!(vcl, "        }}");
        match self.static_asset_match("bereq.url") {
            Some(static_match) => {
                let _ = writeln!(vcl, "        if ({}) {{", static_match);
                let _ = writeln!(vcl, "            unset beresp.http.Set-Cookie;");
                let _ = writeln!(vcl, "            set beresp.ttl = {}s;", self.static_ttl_secs);
                let _ = writeln!(vcl, "        }} else {{");
                let _ = writeln!(vcl, "            set beresp.ttl = {}s;", input.ttl_seconds);
                let _ = writeln!(vcl, "        }}");
            }
            None => {
                let _ = writeln!(vcl, "        set beresp.ttl = {}s;", input.ttl_seconds);
            }
        }
        let _ = writeln!(vcl, "        return (deliver);");
        let _ = writeln!(vcl, "    }}");
        let _ = writeln!(vcl, "}}");

        Ok(vcl)
    }

    fn render_proxy_block(&self, cache_endpoint: &str) -> String {
        format!(
            "location / {{\n    \
             proxy_pass http://{};\n    \
             proxy_set_header Host $host;\n    \
             proxy_set_header X-Real-IP $remote_addr;\n    \
             proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n    \
             proxy_set_header X-Forwarded-Proto $scheme;\n\
             }}\n",
            cache_endpoint
        )
    }
}

/// Include line for a per-site policy path.
pub fn include_line(policy_path: &str) -> String {
    format!("include \"{}\";", policy_path)
}

/// Master configuration written when the host has none yet.
pub fn render_master_base(default_backend: &str) -> CacheMgrResult<String> {
    let (host, port) = split_backend(default_backend)?;
    Ok(format!(
        "vcl 4.1;\n\n\
         # Managed by cachemgrd. Per-site policies are included below.\n\n\
         backend default {{\n    .host = \"{}\";\n    .port = \"{}\";\n}}\n\n",
        host, port
    ))
}

/// Number of lines in `master` equal to `line`.
pub fn count_include(master: &str, line: &str) -> usize {
    master.lines().filter(|l| l.trim() == line).count()
}

/// Ensures `line` occurs exactly once in `master`.
pub fn ensure_include(master: &str, line: &str) -> String {
    match count_include(master, line) {
        1 => master.to_string(),
        0 => {
            let mut out = master.to_string();
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(line);
            out.push('\n');
            out
        }
        _ => {
            let without = remove_include(master, line);
            ensure_include(&without, line)
        }
    }
}

/// Removes every occurrence of `line` from `master`, leaving other lines untouched.
pub fn remove_include(master: &str, line: &str) -> String {
    let mut out = String::with_capacity(master.len());
    for l in master.split_inclusive('\n') {
        if l.trim() != line {
            out.push_str(l);
        }
    }
    out
}

/// Include lines in `master` other than `own`.
pub fn other_includes<'a>(master: &'a str, own: &str) -> Vec<&'a str> {
    master
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("include ") && *l != own)
        .collect()
}
