//! nginx configuration fragments
//!
//! Each function renders one piece of the final file: the proxy-wide header,
//! an upstream block per site, and a server block per virtual host.

use crate::mapping::Site;
use std::fmt::Write;
use std::path::Path;

/// Per-host settings resolved by the renderer before formatting
#[derive(Debug, Clone, Default)]
pub struct HostOptions<'a> {
    /// `(directive, value)` pairs emitted inside the server block
    pub directives: &'a [(String, String)],
    /// Certificate path prefix (`<prefix>.crt` / `<prefix>.key`) when TLS is available
    pub tls_prefix: Option<&'a Path>,
    /// Credential file for basic auth
    pub auth_file: Option<&'a Path>,
}

const SSL_SETTINGS: &str = "\tssl_protocols TLSv1.2 TLSv1.3;
\tssl_ciphers \"ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384\";
\tssl_prefer_server_ciphers on;
\tssl_session_timeout 5m;
\tssl_session_cache shared:SSL:50m;
";

/// Proxy-wide directives and the catch-all default server
pub fn header(syslog: Option<&str>) -> String {
    let logging = match syslog {
        Some(target) => format!(
            "log_format loggly '$remote_addr - $remote_user [$time_local] \"$request\" $status $body_bytes_sent \"$http_referer\" \"$http_user_agent\" - $request_time X-Forwarded-For=$http_x_forwarded_for Host=$host';
error_log syslog:server={target};
access_log syslog:server={target} loggly;
"
        ),
        None => "access_log off;\n".to_string(),
    };

    format!(
        "# Pass along X-Forwarded-Proto if we have it, otherwise the request scheme
map $http_x_forwarded_proto $proxy_x_forwarded_proto {{
\tdefault $http_x_forwarded_proto;
\t''      $scheme;
}}

# Keep upgraded connections upgraded
map $http_upgrade $proxy_connection {{
\tdefault upgrade;
\t''      close;
}}

map $scheme $proxy_x_forwarded_ssl {{
\tdefault off;
\thttps   on;
}}

gzip_types text/plain text/css application/javascript application/json application/x-javascript text/xml application/xml application/xml+rss text/javascript;

{logging}
proxy_http_version 1.1;
proxy_buffering off;
proxy_set_header Host $http_host;
proxy_set_header Upgrade $http_upgrade;
proxy_set_header Connection $proxy_connection;
proxy_set_header X-Real-IP $remote_addr;
proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
proxy_set_header X-Forwarded-Proto $proxy_x_forwarded_proto;
proxy_set_header X-Forwarded-Ssl $proxy_x_forwarded_ssl;

server {{
\tserver_name _;
\tlisten 80;
\treturn 503;
}}
"
    )
}

/// Upstream block named after the container ID
pub fn upstream(site: &Site) -> String {
    format!(
        "
upstream {id} {{
\t## Network: {network}
\tserver {address}:{port};
}}
",
        id = site.id,
        network = site.contact.network,
        address = site.contact.address,
        port = site.contact.port,
    )
}

/// Server block(s) for one virtual host: TLS with redirect, or plain HTTP
pub fn host(host: &str, upstream_id: &str, options: &HostOptions<'_>) -> String {
    let mut out = String::new();

    match options.tls_prefix {
        Some(prefix) => {
            let prefix = prefix.display();
            let _ = write!(
                out,
                "
server {{
\tserver_name {host};
\tlisten 80;
\treturn 301 https://$host$request_uri;
}}

server {{
\tserver_name {host};
\tlisten 443 ssl;

{SSL_SETTINGS}
\tssl_certificate {prefix}.crt;
\tssl_certificate_key {prefix}.key;
\tadd_header Strict-Transport-Security \"max-age=31536000\";
"
            );
        }
        None => {
            let _ = write!(
                out,
                "
server {{
\tserver_name {host};
\tlisten 80;
"
            );
        }
    }

    for (name, value) in options.directives {
        let _ = writeln!(out, "\t{} {};", name, value);
    }
    if let Some(file) = options.auth_file {
        let _ = writeln!(out, "\tauth_basic \"Restricted\";");
        let _ = writeln!(out, "\tauth_basic_user_file {};", file.display());
    }

    let _ = write!(
        out,
        "\tlocation / {{
\t\tproxy_pass http://{upstream_id};
\t}}
}}
"
    );
    out
}
