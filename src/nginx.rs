//! nginx observer: renders the routing table, writes it and reloads nginx
//!
//! Rendering is cheap and happens on every cycle. The file is only rewritten,
//! and nginx only reloaded, when the rendered output differs from what was
//! last applied successfully.

use crate::config::NginxConfig;
use crate::error::{Error, Result};
use crate::mapping::{RoutingTable, Site};
use crate::observer::Observer;
use crate::template::{self, HostOptions};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CERT_NAME_KEY: &str = "CERT_NAME";
pub const AUTH_USER_KEY: &str = "AUTH_USER";
pub const AUTH_PASS_KEY: &str = "AUTH_PASS";

/// Container environment keys that map to nginx directives. Anything not
/// listed here never reaches the config.
const DIRECTIVES: &[(&str, &str)] = &[("NGINX_CLIENT_MAX_BODY_SIZE", "client_max_body_size")];

const CONFIG_MODE: u32 = 0o644;
/// Credential files hold cleartext passwords
const CREDENTIAL_MODE: u32 = 0o600;

/// A file written next to the config, e.g. a basic-auth credential file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Output of one render: config text, side files and their combined digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub text: String,
    pub side_files: Vec<SideFile>,
    pub digest: String,
}

impl RenderedConfig {
    fn new(text: String, side_files: Vec<SideFile>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        for file in &side_files {
            hasher.update([0u8]);
            hasher.update(file.path.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(file.contents.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self {
            text,
            side_files,
            digest,
        }
    }
}

/// Map allow-listed environment keys to nginx directives
pub fn env_to_directives(env: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, directive) in DIRECTIVES {
        let Some(value) = env.get(*key) else { continue };
        if !is_safe_value(value) {
            warn!(key, value, "Ignoring directive value with reserved characters");
            continue;
        }
        out.insert(directive.to_string(), value.clone());
    }
    out
}

fn is_safe_value(value: &str) -> bool {
    !value.is_empty() && !value.contains([';', '{', '}', '\n', '\r'])
}

/// A single path component: no separators, no parent references
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && !host
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '/'))
}

/// Observer that keeps an nginx config file in sync with the routing table
pub struct NginxUpdater {
    config_path: PathBuf,
    cert_dir: PathBuf,
    htpasswd_dir: Option<PathBuf>,
    reload: Vec<String>,
    syslog: Option<String>,
    /// Digest of the last config that was written and reloaded successfully
    last_applied: Mutex<Option<String>>,
}

impl NginxUpdater {
    pub fn new(config_path: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>, reload: Vec<String>) -> Self {
        Self {
            config_path: config_path.into(),
            cert_dir: cert_dir.into(),
            htpasswd_dir: None,
            reload,
            syslog: None,
            last_applied: Mutex::new(None),
        }
    }

    pub fn from_config(config: &NginxConfig) -> Result<Self> {
        let updater = Self::new(&config.config, &config.certs, config.reload_command()?)
            .with_syslog(config.syslog.clone());
        Ok(match &config.htpasswd {
            Some(dir) => updater.with_htpasswd_dir(dir),
            None => updater,
        })
    }

    pub fn with_htpasswd_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.htpasswd_dir = Some(dir.into());
        self
    }

    pub fn with_syslog(mut self, syslog: Option<String>) -> Self {
        self.syslog = syslog;
        self
    }

    /// Certificate prefix for `host` if both `<key>.crt` and `<key>.key` exist.
    ///
    /// `key` is the host name unless the site sets `CERT_NAME`. Keys that
    /// would resolve outside the certificate directory are rejected.
    pub fn ssl_info(&self, host: &str, site: &Site) -> Option<PathBuf> {
        let key = site
            .env
            .get(CERT_NAME_KEY)
            .map(String::as_str)
            .filter(|k| !k.is_empty())
            .unwrap_or(host);
        if !is_plain_file_name(key) {
            warn!(container_id = %site.id, host, key, "Ignoring certificate name outside the certificate directory");
            return None;
        }
        let prefix = self.cert_dir.join(key);
        let crt = self.cert_dir.join(format!("{}.crt", key));
        let pem_key = self.cert_dir.join(format!("{}.key", key));
        (crt.is_file() && pem_key.is_file()).then_some(prefix)
    }

    /// Credential file for `host` when the site sets both user and password
    pub fn http_auth_info(&self, host: &str, site: &Site) -> Option<SideFile> {
        let user = site.env.get(AUTH_USER_KEY).filter(|u| !u.is_empty())?;
        let pass = site.env.get(AUTH_PASS_KEY).filter(|p| !p.is_empty())?;
        let Some(dir) = &self.htpasswd_dir else {
            warn!(host, "Basic auth requested but no htpasswd directory configured");
            return None;
        };
        Some(SideFile {
            path: dir.join(format!("{}.htpasswd", host)),
            contents: format!("{}:{}", user, pass),
        })
    }

    /// Render the full config for `sites`. Only reads the filesystem.
    pub fn render(&self, sites: &[Site]) -> RenderedConfig {
        let mut text = template::header(self.syslog.as_deref());
        let mut side_files = Vec::new();
        let mut seen_hosts = HashSet::new();

        for site in sites {
            text.push_str(&template::upstream(site));
            let directives: Vec<(String, String)> = env_to_directives(&site.env).into_iter().collect();

            for host in &site.hosts {
                if !is_valid_host(host) {
                    warn!(container_id = %site.id, host, "Skipping invalid virtual host");
                    continue;
                }
                if !seen_hosts.insert(host.as_str()) {
                    warn!(container_id = %site.id, host, "Virtual host already served by another container");
                    continue;
                }

                let tls_prefix = self.ssl_info(host, site);
                let auth = self.http_auth_info(host, site);
                let options = HostOptions {
                    directives: &directives,
                    tls_prefix: tls_prefix.as_deref(),
                    auth_file: auth.as_ref().map(|f| f.path.as_path()),
                };
                text.push_str(&template::host(host, &site.id, &options));
                side_files.extend(auth);
            }
        }

        RenderedConfig::new(text, side_files)
    }

    async fn apply(&self, rendered: &RenderedConfig) -> Result<()> {
        for file in &rendered.side_files {
            if let Some(dir) = file.path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
            }
            write_atomic(&file.path, file.contents.as_bytes(), CREDENTIAL_MODE)?;
            debug!(path = %file.path.display(), "Wrote credential file");
        }

        write_atomic(&self.config_path, rendered.text.as_bytes(), CONFIG_MODE)?;
        info!(path = %self.config_path.display(), bytes = rendered.text.len(), "Wrote nginx config");

        self.run_reload().await?;
        self.prune_credentials(&rendered.side_files);
        Ok(())
    }

    /// Remove `*.htpasswd` files the running config no longer references
    fn prune_credentials(&self, keep: &[SideFile]) {
        let Some(dir) = &self.htpasswd_dir else { return };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Cannot list credential directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let stale = path.extension().is_some_and(|ext| ext == "htpasswd")
                && !keep.iter().any(|f| f.path == path);
            if !stale {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale credential file"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove credential file"),
            }
        }
    }

    async fn run_reload(&self) -> Result<()> {
        let Some((program, args)) = self.reload.split_first() else {
            debug!("No reload command configured");
            return Ok(());
        };

        info!(command = ?self.reload, "Reloading nginx");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Reload(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Reload(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Replace `path` with `data` via a temp file in the same directory
fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(data).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(tmp.path(), perms).map_err(|e| Error::io(tmp.path(), e))?;
    }

    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

#[async_trait]
impl Observer for NginxUpdater {
    fn name(&self) -> &str {
        "nginx"
    }

    async fn update(&self, sites: RoutingTable) -> Result<()> {
        let mut last_applied = self.last_applied.lock().await;

        let rendered = self.render(&sites);
        if last_applied.as_deref() == Some(rendered.digest.as_str()) {
            debug!(sites = sites.len(), "nginx config unchanged");
            return Ok(());
        }

        self.apply(&rendered).await?;
        info!(sites = sites.len(), digest = %rendered.digest, "nginx config applied");
        *last_applied = Some(rendered.digest);
        Ok(())
    }
}
