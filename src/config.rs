use crate::docker::{transport_for, TlsMaterial};
use crate::error::{Error, Result};
use crate::watcher::WatcherConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy updater
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Docker endpoints to read containers and events from
    #[serde(default)]
    pub docker: DockerConfig,

    /// Where and how to write the nginx config
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Update loop timing
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Debug socket
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Endpoint containers are listed from (default: local socket)
    #[serde(default = "default_leader")]
    pub leader: String,

    /// Additional endpoints watched only for events
    #[serde(default)]
    pub followers: Vec<String>,

    /// Use TLS for TCP endpoints
    #[serde(default)]
    pub tls: bool,

    /// Directory with `cert.pem`, `key.pem` and `ca.pem`
    pub cert_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// Path of the rendered config file
    #[serde(default = "default_nginx_config")]
    pub config: PathBuf,

    /// Directory holding `<host>.crt` / `<host>.key` pairs
    #[serde(default = "default_cert_dir")]
    pub certs: PathBuf,

    /// Command line run after the config changes, e.g. `nginx -s reload`
    pub reload: Option<String>,

    /// Directory for basic-auth credential files
    pub htpasswd: Option<PathBuf>,

    /// Remote syslog target for nginx logs
    pub syslog: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Unconditional refresh interval in seconds (default: 600)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Quiet period before an update runs, in milliseconds (default: 5000)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Ping an idle event listener after this many seconds (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Reconnect an event listener idle for this many seconds (default: 3600)
    #[serde(default = "default_stale_listener")]
    pub stale_listener_secs: u64,

    /// Maximum delay between connection attempts in milliseconds (default: 30000)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Our own container ID, skipping cgroup detection
    pub container_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    /// Unix socket path for the debug endpoint (disabled when unset)
    pub socket: Option<PathBuf>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            leader: default_leader(),
            followers: Vec::new(),
            tls: false,
            cert_path: None,
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            config: default_nginx_config(),
            certs: default_cert_dir(),
            reload: None,
            htpasswd: None,
            syslog: None,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            debounce_ms: default_debounce(),
            ping_interval_secs: default_ping_interval(),
            stale_listener_secs: default_stale_listener(),
            backoff_cap_ms: default_backoff_cap(),
            container_id: None,
        }
    }
}

impl DockerConfig {
    /// TLS client material, when TLS is enabled
    pub fn tls_material(&self) -> Option<TlsMaterial> {
        if !self.tls {
            return None;
        }
        self.cert_path.as_ref().map(TlsMaterial::from_dir)
    }

    /// Leader followed by all followers
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.leader.as_str()).chain(self.followers.iter().map(String::as_str))
    }
}

impl NginxConfig {
    /// Reload command split into argv (empty when unset)
    pub fn reload_command(&self) -> Result<Vec<String>> {
        match self.reload.as_deref().map(str::trim) {
            None | Some("") => Ok(Vec::new()),
            Some(cmd) => shell_words::split(cmd)
                .map_err(|e| Error::Config(format!("invalid reload command '{}': {}", cmd, e))),
        }
    }
}

impl ManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            stale_after: Duration::from_secs(self.stale_listener_secs),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

// Default value functions
fn default_leader() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_nginx_config() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d/default.conf")
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/opt/nginxssl")
}

fn default_poll_interval() -> u64 {
    600 // 10 minutes
}

fn default_debounce() -> u64 {
    5000 // 5 seconds
}

fn default_ping_interval() -> u64 {
    30
}

fn default_stale_listener() -> u64 {
    3600 // 1 hour
}

fn default_backoff_cap() -> u64 {
    30_000
}

/// Source of environment overrides, abstracted for tests
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl Config {
    /// Load from a TOML file (defaults when it does not exist), apply the
    /// process environment on top and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::load_with_env(path, &ProcessEnv)
    }

    pub fn load_with_env<P: AsRef<Path>>(path: P, env: &dyn EnvSource) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// Override settings from the conventional Docker/nginx environment variables
    pub fn apply_env(&mut self, env: &dyn EnvSource) {
        if let Some(v) = env.var("DOCKER_HOST") {
            self.docker.leader = v;
        }
        if let Some(v) = env.var("DOCKER_TLS_VERIFY") {
            self.docker.tls = !matches!(v.as_str(), "0" | "false");
        }
        if let Some(v) = env.var("DOCKER_CERT_PATH") {
            self.docker.cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env.var("DOCKER_FOLLOWERS") {
            self.docker.followers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = env.var("NGINX_CONF") {
            self.nginx.config = PathBuf::from(v);
        }
        if let Some(v) = env.var("NGINX_CERT_PATH") {
            self.nginx.certs = PathBuf::from(v);
        }
        if let Some(v) = env.var("NGINX_RELOAD_CMD") {
            self.nginx.reload = Some(v);
        }
        if let Some(v) = env.var("NGINX_HTPASSWD_DIR") {
            self.nginx.htpasswd = Some(PathBuf::from(v));
        }
        if let Some(v) = env.var("SYSLOG_HOST") {
            self.nginx.syslog = Some(v);
        }
        if let Some(v) = env.var("CONTAINER_ID") {
            self.manager.container_id = Some(v);
        }
        if let Some(v) = env.var("ADMIN_SOCKET") {
            self.admin.socket = Some(PathBuf::from(v));
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.docker.leader.trim().is_empty() {
            errors.push("docker.leader must not be empty".to_string());
        }
        for endpoint in self.docker.endpoints().filter(|e| !e.trim().is_empty()) {
            if transport_for(endpoint).is_err() {
                errors.push(format!(
                    "unsupported docker endpoint '{}': expected unix:// or tcp://",
                    endpoint
                ));
            }
        }
        if self.docker.tls && self.docker.cert_path.is_none() {
            errors.push("docker.tls requires docker.cert_path".to_string());
        }
        if self.nginx.config.as_os_str().is_empty() {
            errors.push("nginx.config must not be empty".to_string());
        }
        if let Err(e) = self.nginx.reload_command() {
            errors.push(e.to_string());
        }
        if self.manager.poll_interval_secs == 0 {
            errors.push("manager.poll_interval_secs must be greater than 0".to_string());
        }
        if self.manager.ping_interval_secs == 0 {
            errors.push("manager.ping_interval_secs must be greater than 0".to_string());
        }
        if self.manager.stale_listener_secs == 0 {
            errors.push("manager.stale_listener_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}
