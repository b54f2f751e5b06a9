//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("ttlkv").join("config.toml")),
            Some(PathBuf::from("/etc/ttlkv/config.toml")),
            Some(PathBuf::from("./ttlkv.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `TTLKV_*` overrides from any variable source
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Engine overrides
        if let Some(path) = var("TTLKV_PATH") {
            self.engine.path = if path.is_empty() || path == ":memory:" {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(bytes) = var("TTLKV_MAX_DOCUMENT_BYTES") {
            match bytes.parse() {
                Ok(b) => self.engine.max_document_bytes = b,
                Err(_) => tracing::warn!("Ignoring invalid TTLKV_MAX_DOCUMENT_BYTES: {}", bytes),
            }
        }
        if let Some(threshold) = var("TTLKV_FLUSH_THRESHOLD") {
            match threshold.parse() {
                Ok(t) => self.engine.flush_threshold = t,
                Err(_) => tracing::warn!("Ignoring invalid TTLKV_FLUSH_THRESHOLD: {}", threshold),
            }
        }

        // Logging overrides
        if let Some(level) = var("TTLKV_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("TTLKV_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# TTLKV Configuration
#
# Environment variables override these settings:
# - TTLKV_PATH (":memory:" for an in-memory store)
# - TTLKV_MAX_DOCUMENT_BYTES
# - TTLKV_FLUSH_THRESHOLD
# - TTLKV_LOG_LEVEL
# - TTLKV_LOG_FORMAT

[engine]
# Backing file; omit for an in-memory store
# path = "/var/lib/ttlkv/store.tkv"

# Largest accepted document (serialized JSON bytes)
max_document_bytes = 8192

# Compress documents of at least compression_min_bytes with deflate (zlib)
compression_enabled = true
compression_min_bytes = 256

# Base number of mutations between commits
flush_threshold = 10

# Commit pending mutations after this many seconds (0 disables)
auto_flush_secs = 10

# How often expired records are swept (ms)
sweep_interval_ms = 1000

# How often every key is scanned for expiry (seconds)
full_cleanup_interval_secs = 300

# Upper bound for $limit in queries
max_query_limit = 1000

# Pending operations allowed in the queue
queue_capacity = 256

# An empty backing image larger than this is recreated (bytes)
vacuum_threshold_bytes = 4096

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_file_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\npath = \"/tmp/sensors.tkv\"\nflush_threshold = 50\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.engine.path, Some(PathBuf::from("/tmp/sensors.tkv")));
        assert_eq!(config.engine.flush_threshold, 50);
        assert_eq!(config.engine.max_document_bytes, 8192);
        assert!(config.logging.is_json());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_errors() {
        let missing = Config::load(Path::new("/nonexistent/ttlkv.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[engine\nflush_threshold = ").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TTLKV_PATH", "/data/store.tkv"),
            ("TTLKV_MAX_DOCUMENT_BYTES", "4096"),
            ("TTLKV_FLUSH_THRESHOLD", "many"),
            ("TTLKV_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.engine.path, Some(PathBuf::from("/data/store.tkv")));
        assert_eq!(config.engine.max_document_bytes, 4096);
        assert_eq!(config.engine.flush_threshold, 10);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_memory_path_override() {
        let mut config = Config::default();
        config.engine.path = Some(PathBuf::from("/data/store.tkv"));
        config.apply_overrides(|name| (name == "TTLKV_PATH").then(|| ":memory:".to_string()));
        assert_eq!(config.engine.path, None);
    }
}
