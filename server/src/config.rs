//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `ENCCTL_API_KEY`, `ENCCTL_LISTEN`,
//!    `ENCCTL_DATA_DIR`, `ENCCTL_REMOTE_HOST`
//! 2. **Config file**: path via `--config <path>`, or `encctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! data_dir = "/var/lib/encctl"   # relays_cache.json, dns_cache.json, config.json
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [tools]
//! nmcli = "nmcli"
//! mmcli = "mmcli"
//! ip = "ip"
//! timeout_ms = 10000
//!
//! [poll]
//! netif_interval_ms = 1000
//! wifi_resync_secs = 10
//! modem_interval_secs = 5
//!
//! [logging]
//! level = "info"
//!
//! # Optional: omit entirely to disable the cloud relay client
//! [remote]
//! host = "relay.example.com"
//! path = "/ws/remote"
//! port = 443
//! tls = true
//! retry_delay_ms = 1000
//! activity_timeout_secs = 15
//! keepalive_secs = 5
//! dns_timeout_secs = 5
//! connect_timeout_secs = 10
//! gateway_refresh_cmd = ["ip", "route", "flush", "cache"]
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cloud relay client; disabled when absent.
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persisted state. Default `/var/lib/encctl`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `ENCCTL_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// External network-management tools.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_nmcli")]
    pub nmcli: String,
    #[serde(default = "default_mmcli")]
    pub mmcli: String,
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Per-invocation timeout (default 10 000). Modem scans use their own.
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Interface enumeration period (default 1000).
    #[serde(default = "default_netif_interval_ms")]
    pub netif_interval_ms: u64,
    /// Full WiFi re-sync period even without interface changes (default 10).
    #[serde(default = "default_wifi_resync_secs")]
    pub wifi_resync_secs: u64,
    /// Modem poll period (default 5).
    #[serde(default = "default_modem_interval_secs")]
    pub modem_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    #[serde(default = "default_remote_path")]
    pub path: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Constant delay between connection attempts (default 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Close the connection when nothing arrives for this long (default 15).
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_dns_timeout_secs")]
    pub dns_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run when connecting with cached DNS results; empty disables.
    #[serde(default = "default_gateway_refresh_cmd")]
    pub gateway_refresh_cmd: Vec<String>,
}

impl RemoteConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            path: default_remote_path(),
            port: default_remote_port(),
            tls: true,
            retry_delay_ms: default_retry_delay_ms(),
            activity_timeout_secs: default_activity_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            dns_timeout_secs: default_dns_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            gateway_refresh_cmd: default_gateway_refresh_cmd(),
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/encctl".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_nmcli() -> String {
    "nmcli".to_string()
}
fn default_mmcli() -> String {
    "mmcli".to_string()
}
fn default_ip() -> String {
    "ip".to_string()
}
fn default_tool_timeout_ms() -> u64 {
    10_000
}
fn default_netif_interval_ms() -> u64 {
    1000
}
fn default_wifi_resync_secs() -> u64 {
    10
}
fn default_modem_interval_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_remote_path() -> String {
    "/ws/remote".to_string()
}
fn default_remote_port() -> u16 {
    443
}
fn default_true() -> bool {
    true
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_activity_timeout_secs() -> u64 {
    15
}
fn default_keepalive_secs() -> u64 {
    5
}
fn default_dns_timeout_secs() -> u64 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_gateway_refresh_cmd() -> Vec<String> {
    ["ip", "route", "flush", "cache"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            nmcli: default_nmcli(),
            mmcli: default_mmcli(),
            ip: default_ip(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            netif_interval_ms: default_netif_interval_ms(),
            wifi_resync_secs: default_wifi_resync_secs(),
            modem_interval_secs: default_modem_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `encctl.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("encctl.toml").exists() {
            Self::from_file(Path::new("encctl.toml"))?
        } else {
            Config::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("ENCCTL_API_KEY") {
            self.auth.api_key = key;
        }
        if let Some(listen) = var("ENCCTL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = var("ENCCTL_DATA_DIR") {
            self.server.data_dir = dir;
        }
        if let Some(host) = var("ENCCTL_REMOTE_HOST") {
            match &mut self.remote {
                Some(remote) => remote.host = host,
                None => self.remote = Some(RemoteConfig::new(&host)),
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.server.data_dir).as_ref())
    }
}
