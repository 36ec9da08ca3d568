//! Streamer configuration management

use anyhow::{Context, Result, anyhow};
use engine::StreamConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamerConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub output: OutputSettings,
    /// Transfer pool and timeout settings passed to the engine
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Which tuner to open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// USB vendor ID in hex, e.g. "0x0bda"
    pub vendor_id: String,
    /// USB product ID in hex, e.g. "0x2838"
    pub product_id: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: "0x0bda".to_string(),
            product_id: "0x2838".to_string(),
        }
    }
}

impl DeviceSettings {
    /// Parsed (vendor, product) pair
    pub fn ids(&self) -> Result<(u16, u16)> {
        Ok((
            parse_hex_id(&self.vendor_id, "vendor_id")?,
            parse_hex_id(&self.product_id, "product_id")?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSettings {
    /// File to write raw samples to (stdout if unset)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Stop after this many chunks (unbounded if unset)
    #[serde(default)]
    pub max_chunks: Option<u64>,
}

impl StreamerConfig {
    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: StreamerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tuner-streamer").join("streamer.toml")
        } else {
            PathBuf::from(".config/tuner-streamer/streamer.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        self.device.ids()?;

        if self.output.max_chunks == Some(0) {
            return Err(anyhow!("max_chunks must be at least 1"));
        }

        self.stream
            .validate()
            .context("Invalid [stream] configuration")?;
        Ok(())
    }
}

/// Parse a hex USB ID such as "0x0bda"
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x0bda')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = StreamerConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.device.ids().unwrap(), (0x0bda, 0x2838));
        assert!(config.output.path.is_none());
        assert_eq!(config.stream.transfer_count, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0x0bda", "vendor_id").unwrap(), 0x0bda);
        assert_eq!(parse_hex_id("0X2838", "product_id").unwrap(), 0x2838);
        assert!(parse_hex_id("0bda", "vendor_id").is_err());
        assert!(parse_hex_id("0x", "vendor_id").is_err());
        assert!(parse_hex_id("0x12345", "vendor_id").is_err());
        assert!(parse_hex_id("0xzzzz", "vendor_id").is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
[device]
vendor_id = "0x1d50"
product_id = "0x604b"

[stream]
transfer_count = 8
"#;
        let config: StreamerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.ids().unwrap(), (0x1d50, 0x604b));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stream.transfer_count, 8);
        assert_eq!(config.stream.frame_size, 16384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StreamerConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = StreamerConfig::default();
        config.output.max_chunks = Some(0);
        assert!(config.validate().is_err());

        let mut config = StreamerConfig::default();
        config.stream.endpoint = 0x01;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("streamer.toml");

        let mut config = StreamerConfig::default();
        config.output.path = Some(PathBuf::from("/tmp/samples.bin"));
        config.stream.frame_size = 32768;
        config.save(&path).unwrap();

        let loaded = StreamerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.output.path, Some(PathBuf::from("/tmp/samples.bin")));
        assert_eq!(loaded.stream.frame_size, 32768);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(StreamerConfig::load(Some(dir.path().join("missing.toml"))).is_err());
    }
}
