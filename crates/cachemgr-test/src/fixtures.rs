//! Test fixtures for common orchestrator scenarios
//!
//! Paths match the orchestrator's default layout.

use crate::FakeHost;
use cachemgr_common::Site;

/// Default master configuration path.
pub const MASTER_VCL: &str = "/etc/varnish/default.vcl";

/// Default per-site policy directory.
pub const SITE_POLICY_DIR: &str = "/etc/varnish/sites";

/// Default daemon parameter file.
pub const DAEMON_PARAMS: &str = "/etc/default/varnish";

/// Default daemon unit file.
pub const DAEMON_UNIT: &str = "/etc/systemd/system/varnish.service";

/// Daemon service name.
pub const DAEMON_SERVICE: &str = "varnish";

/// Origin service name.
pub const ORIGIN_SERVICE: &str = "nginx";

/// Default origin backup suffix.
pub const BACKUP_SUFFIX: &str = ".cachemgrd.bak";

/// Master configuration shipped by the distribution package.
pub const PACKAGED_MASTER_VCL: &str = "vcl 4.1;

backend default {
    .host = \"127.0.0.1\";
    .port = \"8080\";
}
";

/// nginx site configuration path of a domain.
pub fn origin_config_path(domain: &str) -> String {
    format!("/etc/nginx/sites-available/{}.conf", domain)
}

/// Backup path of a domain's nginx site configuration.
pub fn origin_backup_path(domain: &str) -> String {
    format!("{}{}", origin_config_path(domain), BACKUP_SUFFIX)
}

/// Policy path of a site.
pub fn site_policy_path(site: &Site) -> String {
    format!("{}/{}.vcl", SITE_POLICY_DIR, site.ident())
}

/// Include line of a site's policy.
pub fn site_include(site: &Site) -> String {
    format!("include \"{}\";", site_policy_path(site))
}

/// Common site fixtures
pub mod site_fixtures {
    use super::*;

    /// `example.com` with its `www` alias on `web1`
    pub fn example_com() -> Site {
        Site::new("example", "web1", "example.com").with_alias("www.example.com")
    }

    /// A second tenant on `web1`
    pub fn shop() -> Site {
        Site::new("shop", "web1", "shop.example.net")
    }

    /// A third tenant on `web1` with a wildcard alias
    pub fn blog() -> Site {
        Site::new("blog", "web1", "blog.example.org").with_alias("*.blog.example.org")
    }

    /// A tenant on another host
    pub fn remote() -> Site {
        Site::new("remote", "web2", "remote.example.com")
    }
}

/// Common origin configuration fixtures
pub mod origin_fixtures {
    /// Plain HTTP server block, IPv4 and IPv6
    pub fn http_server(domains: &[&str], root: &str) -> String {
        format!(
            "server {{
    listen 80;
    listen [::]:80;
    server_name {};
    root {};

    index index.html index.php;
}}
",
            domains.join(" "),
            root
        )
    }

    /// PHP site with its own `location /` and a nested PHP handler
    pub fn php_server(domains: &[&str], root: &str) -> String {
        format!(
            "server {{
    listen 80;
    listen [::]:80;
    server_name {};
    root {};

    location / {{
        try_files $uri $uri/ /index.php?$args;
        location ~ \\.php$ {{
            fastcgi_pass unix:/run/php/php-fpm.sock;
        }}
    }}

    location /static/ {{
        expires 7d;
    }}
}}
",
            domains.join(" "),
            root
        )
    }

    /// HTTP redirect block plus an HTTPS server block
    pub fn https_server(domains: &[&str], root: &str) -> String {
        format!(
            "server {{
    listen 80;
    listen [::]:80;
    server_name {names};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl http2;
    listen [::]:443 ssl http2;
    server_name {names};
    root {root};

    ssl_certificate /etc/ssl/certs/{first}.pem;
    ssl_certificate_key /etc/ssl/private/{first}.key;
}}
",
            names = domains.join(" "),
            root = root,
            first = domains.first().copied().unwrap_or("default")
        )
    }
}

/// Places a site's nginx configuration on `host`.
pub fn seed_origin(host: &FakeHost, site: &Site, config: &str) {
    host.set_file(&origin_config_path(&site.domain), config);
}

/// Primary package installation command of the default configuration.
pub const INSTALL_COMMAND: &str = "apt-get install -y varnish";

/// Host with nginx running and a plain HTTP configuration for every site.
/// Installing the daemon package provides `varnishd`.
pub fn web_host(host: &str, sites: &[Site]) -> FakeHost {
    let fake = FakeHost::with_nginx(host);
    fake.provides_on(INSTALL_COMMAND, "varnishd");
    for site in sites {
        let mut domains = vec![site.domain.as_str()];
        domains.extend(site.aliases.iter().map(String::as_str));
        seed_origin(
            &fake,
            site,
            &origin_fixtures::http_server(&domains, &format!("/var/www/{}", site.id)),
        );
    }
    fake
}

/// Like [`web_host`], with the cache daemon already installed and its
/// packaged master configuration in place.
pub fn web_host_with_varnish(host: &str, sites: &[Site]) -> FakeHost {
    let fake = web_host(host, sites);
    fake.install_binary("varnishd");
    fake.set_enabled(DAEMON_SERVICE, true);
    fake.set_file(MASTER_VCL, PACKAGED_MASTER_VCL);
    fake
}
