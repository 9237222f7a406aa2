//! Origin server (nginx) site configuration patching.
//!
//! Every edit is machine-removable without a backup:
//! - the SharedPort proxy fragment is delimited by
//!   `# BEGIN cachemgrd:<site>` / `# END cachemgrd:<site>`;
//! - an existing `location /` block, which would clash with the fragment's
//!   own, is commented out line by line behind `# cachemgrd:<site> off: `;
//! - a DedicatedPort listen rewrite keeps the original directive in a
//!   trailing `# cachemgrd:<site> was: <original>` comment.
//!
//! All functions here are pure text transformations.

use cachemgr_common::{CacheMgrError, CacheMgrResult, TLS_PORT_OFFSET};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static SERVER_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)server\s*\{\s*(#.*)?$").expect("Invalid regex pattern"));

static LISTEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)listen\s+([^\s;]+)([^;]*);").expect("Invalid regex pattern")
});

static ROOT_LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*location\s+/\s*\{").expect("Invalid regex pattern"));

/// Start marker of a site's proxy fragment.
pub fn begin_marker(site_id: &str) -> String {
    format!("# BEGIN cachemgrd:{}", site_id)
}

/// End marker of a site's proxy fragment.
pub fn end_marker(site_id: &str) -> String {
    format!("# END cachemgrd:{}", site_id)
}

fn listen_marker(site_id: &str) -> String {
    format!("# cachemgrd:{} was: ", site_id)
}

fn disabled_marker(site_id: &str) -> String {
    format!("# cachemgrd:{} off: ", site_id)
}

/// Net `{` minus `}` outside a trailing comment.
fn brace_delta(line: &str) -> i32 {
    let code = line.split('#').next().unwrap_or("");
    code.chars().fold(0, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth - 1,
        _ => depth,
    })
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// True if the site's proxy fragment is present.
pub fn has_marked_block(config: &str, site_id: &str) -> bool {
    let begin = begin_marker(site_id);
    config.lines().any(|l| l.trim() == begin)
}

/// Comments out every `location /` block outside cachemgrd fragments,
/// nested locations included.
fn disable_root_locations(config: &str, site_id: &str) -> CacheMgrResult<Vec<String>> {
    let marker = disabled_marker(site_id);
    let mut out = Vec::new();
    let mut in_fragment = false;
    let mut depth = 0i32;

    for line in config.lines() {
        let trimmed = line.trim();
        if depth == 0 {
            if trimmed.starts_with("# BEGIN cachemgrd:") {
                in_fragment = true;
            } else if trimmed.starts_with("# END cachemgrd:") {
                in_fragment = false;
            }
            if in_fragment || !ROOT_LOCATION_RE.is_match(line) {
                out.push(line.to_string());
                continue;
            }
        }

        let indent_len = line.len() - line.trim_start().len();
        out.push(format!("{}{}{}", &line[..indent_len], marker, line.trim_start()));
        depth += brace_delta(line);
    }

    if depth != 0 {
        return Err(CacheMgrError::invalid_config(
            "origin site config",
            "unterminated `location /` block",
        ));
    }
    Ok(out)
}

/// True if any `location /` block was commented out for the site.
pub fn has_disabled_locations(config: &str, site_id: &str) -> bool {
    let marker = disabled_marker(site_id);
    config.lines().any(|l| l.trim_start().starts_with(&marker))
}

/// Uncomments the `location /` blocks disabled for the site.
pub fn restore_root_locations(config: &str, site_id: &str) -> String {
    let marker = disabled_marker(site_id);
    let out: Vec<String> = config
        .lines()
        .map(|line| {
            let rest = line.trim_start();
            match rest.strip_prefix(&marker) {
                Some(original) => format!("{}{}", &line[..line.len() - rest.len()], original),
                None => line.to_string(),
            }
        })
        .collect();
    join_lines(&out, config.ends_with('\n'))
}

/// Inserts the fragment, framed by markers, at the top of every `server`
/// block. An existing `location /` would make nginx reject the config as a
/// duplicate, so it is commented out first. A config that already carries
/// the fragment is returned as is.
pub fn insert_marked_block(config: &str, site_id: &str, block: &str) -> CacheMgrResult<String> {
    if has_marked_block(config, site_id) {
        return Ok(config.to_string());
    }

    let begin = begin_marker(site_id);
    let end = end_marker(site_id);
    let mut out = Vec::new();
    let mut inserted = 0usize;

    for line in disable_root_locations(config, site_id)? {
        let opens_server = SERVER_OPEN_RE.captures(&line).map(|caps| caps[1].to_string());
        out.push(line);
        if let Some(outer) = opens_server {
            let indent = format!("{}    ", outer);
            out.push(format!("{}{}", indent, begin));
            for block_line in block.lines() {
                if block_line.is_empty() {
                    out.push(String::new());
                } else {
                    out.push(format!("{}{}", indent, block_line));
                }
            }
            out.push(format!("{}{}", indent, end));
            inserted += 1;
        }
    }

    if inserted == 0 {
        return Err(CacheMgrError::invalid_config(
            "origin site config",
            "no `server {` block to route through the cache",
        ));
    }
    Ok(join_lines(&out, config.ends_with('\n')))
}

/// Removes every fragment of the site, markers included.
pub fn remove_marked_blocks(config: &str, site_id: &str) -> String {
    let begin = begin_marker(site_id);
    let end = end_marker(site_id);
    let mut out = Vec::new();
    let mut inside = false;

    for line in config.lines() {
        let trimmed = line.trim();
        if !inside && trimmed == begin {
            inside = true;
            continue;
        }
        if inside {
            if trimmed == end {
                inside = false;
            }
            continue;
        }
        out.push(line.to_string());
    }

    join_lines(&out, config.ends_with('\n'))
}

/// Port of a listen address: `80`, `*:80`, `1.2.3.4:80`, `[::]:80`.
/// Unix sockets and names without a port yield `None`.
fn listen_port(address: &str) -> Option<u16> {
    if address.starts_with("unix:") {
        return None;
    }
    if let Ok(port) = address.parse::<u16>() {
        return Some(port);
    }
    let (_, port) = address.rsplit_once(':')?;
    port.parse().ok()
}

/// True if any listen directive of the site was rewritten.
pub fn has_listen_rewrite(config: &str, site_id: &str) -> bool {
    let marker = listen_marker(site_id);
    config.lines().any(|l| l.contains(&marker))
}

/// Moves public listen directives to loopback: HTTP to `backend_port`,
/// HTTPS to `backend_port + TLS_PORT_OFFSET`. Listen parameters such as
/// `ssl` or `default_server` are kept; `ipv6only` is dropped since the
/// new address is IPv4. A second directive for a port already relocated
/// within the same `server` block (typically the IPv6 twin) is commented out.
pub fn rewrite_listen_directives(
    config: &str,
    site_id: &str,
    backend_port: u16,
    public_port: u16,
    public_tls_port: u16,
) -> CacheMgrResult<String> {
    if has_listen_rewrite(config, site_id) {
        return Ok(config.to_string());
    }

    let marker = listen_marker(site_id);
    let tls_port = backend_port.checked_add(TLS_PORT_OFFSET).ok_or_else(|| {
        CacheMgrError::invalid_config("backend_port", "no room for the TLS listener")
    })?;
    let mut relocated = HashSet::new();
    let mut rewritten = 0usize;
    let mut out = Vec::new();

    for line in config.lines() {
        if SERVER_OPEN_RE.is_match(line) {
            relocated.clear();
        }
        let caps = match LISTEN_RE.captures(line) {
            Some(caps) if !line.trim_start().starts_with('#') => caps,
            _ => {
                out.push(line.to_string());
                continue;
            }
        };

        let indent = &caps[1];
        let target = match listen_port(&caps[2]) {
            Some(port) if port == public_port => backend_port,
            Some(port) if port == public_tls_port => tls_port,
            _ => {
                out.push(line.to_string());
                continue;
            }
        };

        let original = line.trim();
        if relocated.insert(target) {
            let params: Vec<&str> = caps[3]
                .split_whitespace()
                .filter(|p| !p.starts_with("ipv6only"))
                .collect();
            let mut directive = format!("listen 127.0.0.1:{}", target);
            for param in params {
                directive.push(' ');
                directive.push_str(param);
            }
            out.push(format!("{}{}; {}{}", indent, directive, marker, original));
            rewritten += 1;
        } else {
            out.push(format!("{}{}{}", indent, marker, original));
        }
    }

    if rewritten == 0 {
        return Err(CacheMgrError::invalid_config(
            "origin site config",
            format!(
                "no listen directive on port {} or {} to relocate",
                public_port, public_tls_port
            ),
        ));
    }
    Ok(join_lines(&out, config.ends_with('\n')))
}

/// Restores every listen directive rewritten for the site.
pub fn revert_listen_directives(config: &str, site_id: &str) -> String {
    let marker = listen_marker(site_id);
    let out: Vec<String> = config
        .lines()
        .map(|line| match line.find(&marker) {
            Some(idx) => {
                let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
                format!("{}{}", indent, &line[idx + marker.len()..])
            }
            None => line.to_string(),
        })
        .collect();
    join_lines(&out, config.ends_with('\n'))
}

/// Removes every edit of the site: proxy fragments, disabled locations and
/// listen rewrites.
pub fn strip_site_edits(config: &str, site_id: &str) -> String {
    let config = restore_root_locations(&remove_marked_blocks(config, site_id), site_id);
    revert_listen_directives(&config, site_id)
}

/// True if the config carries any edit of the site.
pub fn has_site_edits(config: &str, site_id: &str) -> bool {
    has_marked_block(config, site_id)
        || has_disabled_locations(config, site_id)
        || has_listen_rewrite(config, site_id)
}
