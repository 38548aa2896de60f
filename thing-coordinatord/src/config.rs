use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{CALL_TIMEOUT_MS, CONTROL_PORT, DISCOVERY_GROUP, DISCOVERY_PORT};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Local interface address to join the group on
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Things silent for longer than this are reported stale; 0 disables
    #[serde(default)]
    pub stale_after_secs: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// How long a finished API run stays readable
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_group() -> Ipv4Addr {
    DISCOVERY_GROUP.parse().unwrap_or(Ipv4Addr::new(232, 1, 1, 1))
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_buffer_size() -> usize {
    1024
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_control_port() -> u16 {
    CONTROL_PORT
}

fn default_call_timeout() -> u64 {
    CALL_TIMEOUT_MS
}

fn default_run_retention() -> u64 {
    600
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/thing-coordinator/apps.db")
}

fn default_listen() -> String {
    "0.0.0.0:8053".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_discovery_port(),
            interface: default_interface(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 0,
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            call_timeout_ms: default_call_timeout(),
            run_retention_secs: default_run_retention(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
