//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (GATEWAY_HOST, GATEWAY_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenvis_gateway_core::ManagerConfig;
use tenvis_gateway_plugin::SettingValue;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind the status endpoint to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the status endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Dispatch configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Reply cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Plugins, keyed by instance name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

/// Dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of forwards processed concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Wait for a plugin link to become ready, in milliseconds.
    #[serde(default = "default_link_ready_timeout")]
    pub link_ready_timeout_ms: u64,
}

/// Reply cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the in-memory reply cache.
    #[serde(default)]
    pub enabled: bool,

    /// Lifetime of replies without a max-age hint, in milliseconds.
    #[serde(default = "default_ttl")]
    pub default_ttl_ms: u64,

    /// Maximum number of cached replies.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Interval between stats samples, in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

/// Built-in plugin implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    /// Serves resources from memory.
    MemoryTarget,
    /// Originates requests from code.
    MemoryOrigin,
}

/// A configured plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Implementation to instantiate.
    pub kind: PluginKind,

    /// Protocol name; defaults to the instance name.
    #[serde(default)]
    pub protocol: Option<String>,

    /// Plugin settings, validated against the plugin's declarations.
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,

    /// Initial resources of a memory target, keyed `authority/path`.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("GATEWAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    256
}

fn default_link_ready_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_ttl() -> u64 {
    30_000 // 30 seconds
}

fn default_max_entries() -> usize {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dispatch: DispatchConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            link_ready_timeout_ms: default_link_ready_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl_ms: default_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl DispatchConfig {
    /// Convert into the manager's configuration.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_in_flight: self.max_in_flight,
            link_ready_timeout: Duration::from_millis(self.link_ready_timeout_ms),
        }
    }
}

impl PluginConfig {
    /// Protocol name of the instance called `name`.
    #[must_use]
    pub fn protocol_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.protocol.as_deref().unwrap_or(name)
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "gateway.toml",
            "/etc/gateway/gateway.toml",
            "~/.config/gateway/gateway.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
