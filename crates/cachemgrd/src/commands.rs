//! Shell command builders for daemon, origin and purge operations

use cachemgr_common::shell::{self, shellquote};

/// Build probe: daemon binary present on PATH
pub fn build_probe_installed_cmd(binary: &str) -> String {
    format!("command -v {} >/dev/null 2>&1", shellquote(binary))
}

/// Build probe: unit enabled to start on boot
pub fn build_probe_enabled_cmd(service: &str) -> String {
    format!(
        "{} is-enabled --quiet {}",
        shell::SYSTEMCTL_CMD,
        shellquote(service)
    )
}

/// Build probe: unit currently running
pub fn build_is_active_cmd(service: &str) -> String {
    format!(
        "{} is-active --quiet {}",
        shell::SYSTEMCTL_CMD,
        shellquote(service)
    )
}

/// Build enable-on-boot command
pub fn build_enable_service_cmd(service: &str) -> String {
    format!("{} enable {}", shell::SYSTEMCTL_CMD, shellquote(service))
}

/// Build restart command; picks up unit file changes first
pub fn build_restart_service_cmd(service: &str) -> String {
    format!(
        "{} daemon-reload && {} restart {}",
        shell::SYSTEMCTL_CMD,
        shell::SYSTEMCTL_CMD,
        shellquote(service)
    )
}

/// Build reload command
pub fn build_reload_service_cmd(service: &str) -> String {
    format!("{} reload {}", shell::SYSTEMCTL_CMD, shellquote(service))
}

/// Build start command
pub fn build_start_service_cmd(service: &str) -> String {
    format!("{} start {}", shell::SYSTEMCTL_CMD, shellquote(service))
}

/// Build stop command
pub fn build_stop_service_cmd(service: &str) -> String {
    format!("{} stop {}", shell::SYSTEMCTL_CMD, shellquote(service))
}

/// Build origin reload: syntax check, then reload
pub fn build_origin_reload_cmd(test_command: &str, service: &str) -> String {
    format!(
        "{} && {}",
        test_command,
        build_reload_service_cmd(service)
    )
}

/// Escapes a hostname for use inside a daemon regular expression
fn regex_literal(name: &str) -> String {
    name.replace('.', "[.]").replace('*', "[^.]+")
}

/// Build the host-scoped ban expression for a set of hostnames
///
/// `req.http.host ~ "^(example[.]com|www[.]example[.]com)$"`
pub fn build_host_ban_expression(hostnames: &[&str]) -> String {
    let alternatives: Vec<String> = hostnames.iter().map(|h| regex_literal(h)).collect();
    format!(
        "req.http.host ~ \"^({})(:[0-9]+)?$\"",
        alternatives.join("|")
    )
}

/// Build the ban expression for a path pattern within the site's hostnames
pub fn build_pattern_ban_expression(hostnames: &[&str], pattern: &str) -> String {
    format!(
        "{} && req.url ~ \"{}\"",
        build_host_ban_expression(hostnames),
        pattern
    )
}

/// Build the ban expression for exactly one path within the site's hostnames
pub fn build_exact_ban_expression(hostnames: &[&str], path: &str) -> String {
    format!(
        "{} && req.url == \"{}\"",
        build_host_ban_expression(hostnames),
        path
    )
}

/// Build an administrative ban through `varnishadm`
pub fn build_admin_ban_cmd(admin_address: &str, secret_path: &str, expression: &str) -> String {
    format!(
        "{} -T {} -S {} {}",
        shell::VARNISHADM_CMD,
        shellquote(admin_address),
        shellquote(secret_path),
        shellquote(&format!("ban {}", expression))
    )
}

/// Build an HTTP PURGE of one path against the daemon's local address
pub fn build_http_purge_cmd(endpoint: &str, hostname: &str, path: &str) -> String {
    format!(
        "{} -fsS -o /dev/null -X PURGE -H {} {}",
        shell::CURL_CMD,
        shellquote(&format!("Host: {}", hostname)),
        shellquote(&format!("http://{}{}", endpoint, path))
    )
}

/// Build an HTTP BAN with wildcard scope, optionally narrowed to a path pattern
pub fn build_http_ban_cmd(endpoint: &str, hostname: &str, url_pattern: Option<&str>) -> String {
    let mut cmd = format!(
        "{} -fsS -o /dev/null -X BAN -H {} -H {}",
        shell::CURL_CMD,
        shellquote(&format!("Host: {}", hostname)),
        shellquote("X-Ban-Scope: *")
    );
    if let Some(pattern) = url_pattern {
        cmd.push_str(&format!(
            " -H {}",
            shellquote(&format!("X-Ban-Url: {}", pattern))
        ));
    }
    cmd.push_str(&format!(" {}", shellquote(&format!("http://{}/", endpoint))));
    cmd
}
