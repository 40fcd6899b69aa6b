//! Configuration loading and validation

use anyhow::{Context, Result};
use meshlink_core::{CodecConfig, DiffConfig};
use meshlink_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::pipeline::PipelineConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        meshlink_transport::stream_url(&self.transport.server_url, &self.transport.path, "probe")
            .with_context(|| format!("invalid server_url {:?}", self.transport.server_url))?;
        if self.diff.vertex_tolerance.is_nan() || self.diff.vertex_tolerance < 0.0 {
            anyhow::bail!("diff.vertex_tolerance must be non-negative");
        }
        if self.diff.cache_capacity == 0 {
            anyhow::bail!("diff.cache_capacity must be at least 1");
        }
        if self.pipeline.work_queue == 0 {
            anyhow::bail!("pipeline.work_queue must be at least 1");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        transport: TransportConfig {
            server_url: "https://stream.example.com".to_string(),
            ..TransportConfig::default()
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::CompressionLevel;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transport.queue_capacity, 1000);
        assert_eq!(config.diff.cache_capacity, 10);
        assert_eq!(config.codec.level, CompressionLevel::Medium);
        assert_eq!(config.pipeline.delta_threshold, 0.5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.toml");
        save_default_config(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[transport]"));
        assert!(content.contains("[diff]"));

        let config = load_config(&path).unwrap();
        assert_eq!(config.transport.server_url, "https://stream.example.com");
        assert_eq!(config.transport.path, "/stream");
        assert_eq!(config.diff.vertex_tolerance, 0.001);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.toml");
        std::fs::write(
            &path,
            "[transport]\nserver_url = \"http://10.0.0.2:9000\"\napi_key = \"k\"\n\n[codec]\nlevel = \"maximum\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.transport.api_key.as_deref(), Some("k"));
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.codec.level, CompressionLevel::Maximum);
        assert_eq!(config.diff.cell_size, 0.1);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.toml");
        std::fs::write(&path, "[transport]\nserver_url = \"gopher://old\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshlink.toml");
        std::fs::write(&path, "[transport\nserver_url = 3").unwrap();
        assert!(load_config(&path).is_err());
    }
}
