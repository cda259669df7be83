use crate::error::{Result, SidecarError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Longest accepted interval between status polls (one day)
pub const MAX_POLL_INTERVAL_SECS: u64 = 86_400;

/// Longest accepted shutdown deadline (one hour)
pub const MAX_STOP_TIMEOUT_SECS: u64 = 3_600;

/// Sidecar configuration: global settings plus the ordered unit list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Version reported by the sidecar
    #[serde(default = "default_version")]
    pub version: String,

    /// Whether to serve the liveness endpoint
    #[serde(default)]
    pub health_check: bool,

    /// Address the liveness endpoint binds to
    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Interval between status polls (in seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Deadline for stopping all units at shutdown (in seconds)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Units to add at boot
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// One configured unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Registry name of the unit
    pub name: String,

    /// Boot order; 0 disables the unit (it is added but never started)
    #[serde(default = "default_boot_order")]
    pub boot_order: u32,

    /// Raw configuration, decoded by the unit's own schema
    #[serde(default)]
    pub config: serde_json::Value,
}

// Default value functions for serde
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_health_addr() -> String {
    crate::health::DEFAULT_HEALTH_ADDR.to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stop_timeout() -> u64 {
    20
}

fn default_boot_order() -> u32 {
    1
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            health_check: false,
            health_addr: default_health_addr(),
            poll_interval_secs: default_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            plugins: Vec::new(),
        }
    }
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            boot_order: default_boot_order(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.boot_order > 0
    }
}

impl SidecarConfig {
    /// Load the configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SidecarError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let config = match extension {
            "toml" => Self::from_toml_str(&contents)?,
            "json" => Self::from_json_str(&contents)?,
            _ => {
                return Err(SidecarError::ConfigError(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        tracing::debug!(
            "Loaded {} plugin entries from {}",
            config.plugins.len(),
            path.display()
        );

        Ok(config)
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| SidecarError::ConfigError(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| SidecarError::ConfigError(format!("Failed to parse JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.trim().is_empty() {
                return Err(SidecarError::ConfigError(
                    "plugin name must not be empty".to_string(),
                ));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(SidecarError::ConfigError(format!(
                    "plugin {} is configured more than once",
                    plugin.name
                )));
            }
        }

        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&self.poll_interval_secs) {
            return Err(SidecarError::ConfigError(format!(
                "poll_interval_secs must be between 1 and {}",
                MAX_POLL_INTERVAL_SECS
            )));
        }

        if !(1..=MAX_STOP_TIMEOUT_SECS).contains(&self.stop_timeout_secs) {
            return Err(SidecarError::ConfigError(format!(
                "stop_timeout_secs must be between 1 and {}",
                MAX_STOP_TIMEOUT_SECS
            )));
        }

        if self.health_check && self.health_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(SidecarError::ConfigError(format!(
                "Invalid health_addr: {}",
                self.health_addr
            )));
        }

        Ok(())
    }

    /// Configured entry for `name`
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Whether `name` may start; units absent from the file are eligible
    pub fn is_enabled(&self, name: &str) -> bool {
        self.plugin(name).map(PluginConfig::is_enabled).unwrap_or(true)
    }

    /// Plugins in ascending boot order, declaration order on ties
    pub fn boot_plan(&self) -> Vec<&PluginConfig> {
        let mut plan: Vec<&PluginConfig> = self.plugins.iter().collect();
        plan.sort_by_key(|p| p.boot_order);
        plan
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_toml_with_defaults() {
        let toml = r#"
            [[plugins]]
            name = "echo"

            [[plugins]]
            name = "heartbeat"
            boot_order = 2
            config = { interval_ms = 500, message = "tick" }
        "#;

        let config = SidecarConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert!(!config.health_check);
        assert_eq!(config.health_addr, "0.0.0.0:8080");
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.stop_timeout(), Duration::from_secs(20));
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].boot_order, 1);
        assert_eq!(config.plugins[0].config, serde_json::Value::Null);
        assert_eq!(
            config.plugins[1].config,
            json!({ "interval_ms": 500, "message": "tick" })
        );
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "version": "1.2.3",
            "health_check": true,
            "health_addr": "127.0.0.1:9090",
            "plugins": [{ "name": "echo", "config": {} }]
        }"#;

        let config = SidecarConfig::from_json_str(json).unwrap();
        assert_eq!(config.version, "1.2.3");
        assert!(config.health_check);
        assert_eq!(config.plugins[0].config, json!({}));
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let toml = r#"
            [[plugins]]
            name = "echo"

            [[plugins]]
            name = "echo"
        "#;

        let result = SidecarConfig::from_toml_str(toml);
        assert!(matches!(result, Err(SidecarError::ConfigError(_))));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(SidecarConfig::from_toml_str("poll_interval_secs = 0").is_err());
        assert!(SidecarConfig::from_toml_str("stop_timeout_secs = 0").is_err());
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        let huge = format!("poll_interval_secs = {}", i64::MAX);
        assert!(matches!(
            SidecarConfig::from_toml_str(&huge),
            Err(SidecarError::ConfigError(msg)) if msg.contains("poll_interval_secs")
        ));

        let huge = format!("stop_timeout_secs = {}", i64::MAX);
        assert!(matches!(
            SidecarConfig::from_toml_str(&huge),
            Err(SidecarError::ConfigError(msg)) if msg.contains("stop_timeout_secs")
        ));

        let edge = format!(
            "poll_interval_secs = {}\nstop_timeout_secs = {}",
            MAX_POLL_INTERVAL_SECS, MAX_STOP_TIMEOUT_SECS
        );
        assert!(SidecarConfig::from_toml_str(&edge).is_ok());
    }

    #[test]
    fn test_bad_health_addr_rejected() {
        let result = SidecarConfig::from_toml_str("health_check = true\nhealth_addr = \"nowhere\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_enablement_and_boot_plan() {
        let mut config = SidecarConfig::default();
        config.plugins = vec![
            PluginConfig {
                boot_order: 3,
                ..PluginConfig::new("late", json!({}))
            },
            PluginConfig {
                boot_order: 0,
                ..PluginConfig::new("off", json!({}))
            },
            PluginConfig::new("first", json!({})),
            PluginConfig::new("also-first", json!({})),
        ];

        assert!(config.is_enabled("late"));
        assert!(!config.is_enabled("off"));
        assert!(config.is_enabled("unconfigured"));

        let order: Vec<&str> = config.boot_plan().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(order, vec!["off", "first", "also-first", "late"]);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.yaml");
        std::fs::write(&path, "plugins: []").unwrap();

        let result = SidecarConfig::from_file(&path);
        assert!(matches!(result, Err(SidecarError::ConfigError(msg)) if msg.contains("Unsupported")));
    }
}
