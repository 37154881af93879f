//! Driver configuration
//!
//! The host hands the driver a JSON mapping; keys follow the gateway's
//! upper-case convention (`DRIVER_FS_PLUGIN`, `DATASET_DIR`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block_cache::BlockCacheConfig;
use crate::error::{Result, SyncError};
use crate::types::CommandTtl;

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    300
}

/// Settings recognized at initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Identifier of the backend plugin.
    #[serde(rename = "DRIVER_FS_PLUGIN")]
    pub plugin: String,
    /// Plugin configuration: an object, or a string holding JSON.
    #[serde(rename = "DRIVER_FS_PLUGIN_CONFIG", default)]
    pub plugin_config: Value,
    /// Root of the dataset inside the backend namespace.
    #[serde(rename = "DATASET_DIR")]
    pub dataset_dir: String,
    /// Walk the whole dataset at startup (discover role only).
    #[serde(rename = "RESYNC_ON_INIT", default = "default_true")]
    pub resync_on_init: bool,
    /// Read TTL stamped on commands, seconds.
    #[serde(rename = "METADATA_READ_TTL", default = "default_ttl_secs")]
    pub metadata_read_ttl: u64,
    /// Write TTL stamped on commands, seconds.
    #[serde(rename = "METADATA_WRITE_TTL", default = "default_ttl_secs")]
    pub metadata_write_ttl: u64,
    /// Block cache size in entries.
    #[serde(rename = "CACHE_CAPACITY", default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Block cache entry lifetime, seconds.
    #[serde(rename = "CACHE_TTL", default = "default_ttl_secs")]
    pub cache_ttl: u64,
}

impl DriverConfig {
    /// Config for `plugin` serving `dataset_dir`, everything else defaulted.
    pub fn new(plugin: &str, dataset_dir: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            plugin_config: Value::Null,
            dataset_dir: dataset_dir.to_string(),
            resync_on_init: true,
            metadata_read_ttl: default_ttl_secs(),
            metadata_write_ttl: default_ttl_secs(),
            cache_capacity: default_cache_capacity(),
            cache_ttl: default_ttl_secs(),
        }
    }

    /// Parses and validates a configuration mapping.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut config: DriverConfig = serde_json::from_value(value)
            .map_err(|e| SyncError::config(format!("invalid driver configuration: {}", e)))?;
        config.validate()?;
        config.dataset_dir = normalize_dir(&config.dataset_dir);
        Ok(config)
    }

    /// Parses and validates a configuration document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| SyncError::config(format!("configuration is not JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Checks required settings.
    pub fn validate(&self) -> Result<()> {
        if self.plugin.trim().is_empty() {
            return Err(SyncError::config("DRIVER_FS_PLUGIN is empty"));
        }
        if !self.dataset_dir.starts_with('/') {
            return Err(SyncError::config(format!(
                "DATASET_DIR must be absolute: {:?}",
                self.dataset_dir
            )));
        }
        if self.cache_capacity == 0 {
            return Err(SyncError::config("CACHE_CAPACITY must be positive"));
        }
        Ok(())
    }

    /// Plugin configuration with `secrets` merged over it.
    ///
    /// A string-valued configuration is parsed as JSON first.
    pub fn resolved_plugin_config(&self, secrets: Option<&Value>) -> Result<Value> {
        let mut resolved = match &self.plugin_config {
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                SyncError::config(format!("DRIVER_FS_PLUGIN_CONFIG is not valid JSON: {}", e))
            })?,
            other => other.clone(),
        };

        match secrets {
            None | Some(Value::Null) => {}
            Some(Value::Object(secrets)) => {
                if resolved.is_null() {
                    resolved = Value::Object(Default::default());
                }
                let target = resolved.as_object_mut().ok_or_else(|| {
                    SyncError::config("DRIVER_FS_PLUGIN_CONFIG must be an object to merge secrets")
                })?;
                for (key, value) in secrets {
                    target.insert(key.clone(), value.clone());
                }
            }
            Some(_) => return Err(SyncError::config("secrets must be an object")),
        }
        Ok(resolved)
    }

    /// TTLs stamped on every command.
    pub fn command_ttl(&self) -> CommandTtl {
        CommandTtl {
            read_ttl_ms: self.metadata_read_ttl.saturating_mul(1000),
            write_ttl_ms: self.metadata_write_ttl.saturating_mul(1000),
        }
    }

    /// Block cache sizing.
    pub fn block_cache_config(&self) -> BlockCacheConfig {
        BlockCacheConfig {
            capacity: self.cache_capacity,
            ttl_secs: self.cache_ttl,
        }
    }
}

fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let config = DriverConfig::from_value(json!({
            "DRIVER_FS_PLUGIN": "local",
            "DATASET_DIR": "/"
        }))
        .unwrap();
        assert!(config.resync_on_init);
        assert_eq!(config.metadata_read_ttl, 300);
        assert_eq!(config.metadata_write_ttl, 300);
        assert_eq!(config.cache_capacity, 300);
        assert_eq!(config.cache_ttl, 300);
        assert!(config.plugin_config.is_null());
    }

    #[test]
    fn test_missing_plugin_is_config_error() {
        let err = DriverConfig::from_value(json!({"DATASET_DIR": "/"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_relative_dataset_dir_rejected() {
        let err = DriverConfig::from_value(json!({
            "DRIVER_FS_PLUGIN": "local",
            "DATASET_DIR": "data"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = DriverConfig::from_value(json!({
            "DRIVER_FS_PLUGIN": "local",
            "DATASET_DIR": "/",
            "CACHE_CAPACITY": 0
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_dataset_dir_trailing_slash_stripped() {
        let config = DriverConfig::from_json_str(
            r#"{"DRIVER_FS_PLUGIN": "memory", "DATASET_DIR": "/data/"}"#,
        )
        .unwrap();
        assert_eq!(config.dataset_dir, "/data");
    }

    #[test]
    fn test_plugin_config_string_parsed() {
        let mut config = DriverConfig::new("local", "/");
        config.plugin_config = json!(r#"{"work_root": "/srv"}"#);
        let resolved = config.resolved_plugin_config(None).unwrap();
        assert_eq!(resolved["work_root"], "/srv");
    }

    #[test]
    fn test_unparseable_plugin_config() {
        let mut config = DriverConfig::new("local", "/");
        config.plugin_config = json!("{not json");
        let err = config.resolved_plugin_config(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_secrets_override_plugin_config() {
        let mut config = DriverConfig::new("s3", "/");
        config.plugin_config = json!({"bucket": "b", "key": "public"});
        let resolved = config
            .resolved_plugin_config(Some(&json!({"key": "secret"})))
            .unwrap();
        assert_eq!(resolved["bucket"], "b");
        assert_eq!(resolved["key"], "secret");
    }

    #[test]
    fn test_command_ttl_in_millis() {
        let mut config = DriverConfig::new("memory", "/");
        config.metadata_read_ttl = 2;
        config.metadata_write_ttl = 3;
        let ttl = config.command_ttl();
        assert_eq!(ttl.read_ttl_ms, 2000);
        assert_eq!(ttl.write_ttl_ms, 3000);
    }
}
