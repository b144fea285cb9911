// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Configuration module

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Log level
    pub log_level: String,

    /// Polling loop timing
    pub scheduler: SchedulerConfig,

    /// Engine settings
    pub simulation: SimulationConfig,

    /// Where devices come from
    pub registry: RegistryConfig,

    /// Sink enablement and connection parameters
    pub sinks: SinkSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            scheduler: SchedulerConfig::default(),
            simulation: SimulationConfig::default(),
            registry: RegistryConfig::default(),
            sinks: SinkSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Rejects values the scheduler cannot run with. Sink problems are not
    /// fatal here; sinks report them through their status instead.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_ms == 0 {
            bail!("scheduler.interval_ms must be greater than zero");
        }
        if !self.simulation.physics_dt.is_finite() || self.simulation.physics_dt <= 0.0 {
            bail!("simulation.physics_dt must be a positive number");
        }
        Ok(())
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("fleetsim"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target tick interval
    pub interval_ms: u64,

    /// Lower bound on the sleep between ticks
    pub min_sleep_ms: u64,

    /// How long a fetched device list is reused
    pub registry_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            min_sleep_ms: 50,
            registry_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,

    /// Physics time step per tick
    pub physics_dt: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            physics_dt: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// JSON array of devices
    #[default]
    File,
    /// Device table of the management database
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: RegistryKind,
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::File,
            path: PathBuf::from("./data/fleet.json"),
        }
    }
}

/// Per-sink enablement flags and connection parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkSettings {
    pub timeseries: TimeSeriesSettings,
    pub pubsub: PubSubSettings,
    pub fieldbus: FieldbusSettings,
    pub nodegraph: NodeGraphSettings,
}

/// Time-series store reached over its REST SQL endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeSeriesSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub timeout_ms: u64,
}

impl Default for TimeSeriesSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 6041,
            user: "root".to_string(),
            password: "taosdata".to_string(),
            database: "fleetsim".to_string(),
            timeout_ms: 5000,
        }
    }
}

impl TimeSeriesSettings {
    /// First required field that is missing, if any
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.host.trim().is_empty() {
            Some("host")
        } else if self.user.is_empty() {
            Some("user")
        } else if self.database.trim().is_empty() {
            Some("database")
        } else {
            None
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PubSubSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Topic with a `{device_id}` placeholder
    pub topic_template: String,
    pub keep_alive_secs: u64,
    /// 0 = at most once, 1 = at least once
    pub qos: u8,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "fleetsim".to_string(),
            topic_template: "devices/{device_id}/data".to_string(),
            keep_alive_secs: 30,
            qos: 0,
        }
    }
}

impl PubSubSettings {
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.host.trim().is_empty() {
            Some("host")
        } else if self.topic_template.trim().is_empty() {
            Some("topic_template")
        } else {
            None
        }
    }

    pub fn topic_for(&self, device_id: &str) -> String {
        self.topic_template.replace("{device_id}", device_id)
    }
}

/// Register-mapped fieldbus emulation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldbusSettings {
    pub enabled: bool,
    /// `host:port` for the Modbus-TCP listener; no listener when absent
    pub listen: Option<String>,
    pub unit_id: u8,
    /// First register of the first device block
    pub base_offset: u16,
    /// Registers reserved per device
    pub block_size: u16,
    /// Size of the holding register space
    pub register_count: usize,
}

impl Default for FieldbusSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: None,
            unit_id: 1,
            base_offset: 100,
            block_size: 100,
            register_count: 10000,
        }
    }
}

impl FieldbusSettings {
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.block_size == 0 {
            Some("block_size")
        } else if self.register_count <= self.base_offset as usize {
            Some("register_count")
        } else {
            None
        }
    }
}

/// Node-graph address space and its session endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeGraphSettings {
    pub enabled: bool,
    /// `host:port` for the WebSocket session endpoint; no listener when absent
    pub listen: Option<String>,
    pub namespace_uri: String,
    /// Pending updates before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for NodeGraphSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: None,
            namespace_uri: "urn:fleetsim:devices".to_string(),
            queue_capacity: 1024,
        }
    }
}

impl NodeGraphSettings {
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.namespace_uri.trim().is_empty() {
            Some("namespace_uri")
        } else if self.queue_capacity == 0 {
            Some("queue_capacity")
        } else {
            None
        }
    }
}

/// Source of sink settings, consulted at the start of every tick
pub trait ConfigProvider: Send + Sync {
    fn sink_settings(&self) -> SinkSettings;
}

impl ConfigProvider for SinkSettings {
    fn sink_settings(&self) -> SinkSettings {
        self.clone()
    }
}

/// Sink settings that can be replaced while the engine runs
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<SinkSettings>>,
}

impl SharedConfig {
    pub fn new(settings: SinkSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn replace(&self, settings: SinkSettings) {
        *self.inner.write() = settings;
    }

    pub fn update(&self, f: impl FnOnce(&mut SinkSettings)) {
        f(&mut self.inner.write());
    }
}

impl ConfigProvider for SharedConfig {
    fn sink_settings(&self) -> SinkSettings {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"

            [scheduler]
            interval_ms = 250

            [sinks.pubsub]
            enabled = true
            topic_template = "plant/{device_id}"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.scheduler.interval_ms, 250);
        assert_eq!(config.scheduler.registry_ttl_secs, 5);
        assert!(config.sinks.pubsub.enabled);
        assert_eq!(config.sinks.pubsub.port, 1883);
        assert_eq!(config.sinks.pubsub.topic_for("m-7"), "plant/m-7");
        assert_eq!(config.sinks.fieldbus.base_offset, 100);
        assert!(!config.sinks.timeseries.enabled);
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.scheduler.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_fields() {
        let mut ts = TimeSeriesSettings::default();
        assert_eq!(ts.missing_field(), None);
        ts.database.clear();
        assert_eq!(ts.missing_field(), Some("database"));

        let fb = FieldbusSettings { register_count: 50, ..Default::default() };
        assert_eq!(fb.missing_field(), Some("register_count"));
    }

    #[test]
    fn test_shared_config_updates() {
        let shared = SharedConfig::default();
        let reader: Arc<dyn ConfigProvider> = Arc::new(shared.clone());
        assert!(!reader.sink_settings().fieldbus.enabled);

        shared.update(|s| s.fieldbus.enabled = true);
        assert!(reader.sink_settings().fieldbus.enabled);
    }
}
