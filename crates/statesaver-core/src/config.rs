//! Configuration loading and typed config structures for `StateSaver`.
//!
//! Configuration is a YAML file whose sections mirror the structs below.
//! Every field has a default, so an empty file (or no file) is valid.
//!
//! ```yaml
//! storage:
//!   provider: file
//!   path: Databases/statesaver2.sqlite
//!   max_connections: 4
//!   busy_timeout_ms: 5000
//! swap:
//!   drain_timeout_ms: 30000
//!   drain_poll_interval_ms: 1000
//! classifications:
//!   b-m-r: 2
//! logging:
//!   level: info
//!   json: false
//! ```
//!
//! Environment variables override YAML values:
//! - `STATESAVER_DB_PATH` overrides `storage.path`
//! - `STATESAVER_PROVIDER` overrides `storage.provider`
//! - `STATESAVER_LOG_LEVEL` overrides `logging.level`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use statesaver_db::{
    ClassificationRegistry, FileProvider, MemoryProvider, ProviderKind, StorageProvider,
};

use crate::swap::SwapSettings;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range or inconsistent with another value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StateSaverConfig {
    /// Where the primary store lives.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Provider swap timing.
    #[serde(default)]
    pub swap: SwapConfig,

    /// Extra classifications registered on top of the built-in ones.
    #[serde(default)]
    pub classifications: BTreeMap<String, i32>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StateSaverConfig {
    /// Load, override from the process environment, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, and
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse a YAML string, override from the process environment, and
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML and
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(yaml, |key| std::env::var(key).ok())
    }

    /// Like [`parse`](Self::parse) but reads overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`parse`](Self::parse).
    pub fn parse_with_env(
        yaml: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides_from(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STATESAVER_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `STATESAVER_PROVIDER` names an
    /// unknown provider.
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup("STATESAVER_DB_PATH") {
            self.storage.path = PathBuf::from(val);
        }
        if let Some(val) = lookup("STATESAVER_PROVIDER") {
            self.storage.provider = val
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("STATESAVER_PROVIDER: {e}")))?;
        }
        if let Some(val) = lookup("STATESAVER_LOG_LEVEL") {
            self.logging.level = val;
        }
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_connections must be at least 1".to_owned(),
            ));
        }
        if self.storage.provider == ProviderKind::File && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "storage.path is required for the file provider".to_owned(),
            ));
        }
        if self.swap.drain_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "swap.drain_poll_interval_ms must be positive".to_owned(),
            ));
        }
        if self.swap.drain_timeout_ms < self.swap.drain_poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "swap.drain_timeout_ms ({}) is shorter than swap.drain_poll_interval_ms ({})",
                self.swap.drain_timeout_ms, self.swap.drain_poll_interval_ms
            )));
        }
        if let Some(prefix) = self.classifications.keys().find(|p| p.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "classification prefix `{prefix}` is empty"
            )));
        }
        Ok(())
    }

    /// Registry holding the built-in classifications plus the configured ones.
    pub fn registry(&self) -> ClassificationRegistry {
        ClassificationRegistry::with_defaults().with_classifications(
            self.classifications
                .iter()
                .map(|(prefix, priority)| (prefix, *priority)),
        )
    }
}

/// Primary store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// Provider implementation.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Database file, for the file provider.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Maximum pooled connections per store.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a connection waits on a locked database, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Provider for the primary store.
    pub fn provider(&self) -> Arc<dyn StorageProvider> {
        match self.provider {
            ProviderKind::File => Arc::new(self.file_provider(&self.path)),
            ProviderKind::Memory => Arc::new(MemoryProvider::new("primary")),
        }
    }

    /// File provider at `path` with this section's pool settings. Used for
    /// swap targets.
    pub fn file_provider(&self, path: impl Into<PathBuf>) -> FileProvider {
        FileProvider::new(path)
            .with_max_connections(self.max_connections)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }
}

/// Provider swap timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SwapConfig {
    /// Longest time a swap waits for a running replay to stop.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Interval between drain progress checks.
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl SwapConfig {
    /// Timing as used by the swap coordinator.
    pub const fn settings(&self) -> SwapSettings {
        SwapSettings {
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            poll_interval: Duration::from_millis(self.drain_poll_interval_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) used when `RUST_LOG` is
    /// not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    PathBuf::from("Databases/statesaver2.sqlite")
}

const fn default_max_connections() -> u32 {
    4
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_drain_timeout_ms() -> u64 {
    30_000
}

const fn default_drain_poll_interval_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_document_gives_defaults() {
        let config = StateSaverConfig::parse_with_env("", no_env).unwrap();
        assert_eq!(config, StateSaverConfig::default());
        assert_eq!(config.storage.path, PathBuf::from("Databases/statesaver2.sqlite"));
        assert_eq!(config.swap.settings().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn parses_all_sections() {
        let yaml = r"
storage:
  provider: memory
  max_connections: 2
swap:
  drain_timeout_ms: 500
  drain_poll_interval_ms: 50
classifications:
  a-h: 3
logging:
  level: debug
  json: true
";
        let config = StateSaverConfig::parse_with_env(yaml, no_env).unwrap();
        assert_eq!(config.storage.provider, ProviderKind::Memory);
        assert_eq!(config.storage.max_connections, 2);
        assert_eq!(config.swap.settings().drain_timeout, Duration::from_millis(500));
        assert_eq!(config.classifications.get("a-h"), Some(&3));
        assert!(config.logging.json);
        assert_eq!(config.storage.provider().describe(), "memory:primary");
    }

    #[test]
    fn env_overrides_yaml() {
        let config = StateSaverConfig::parse_with_env("logging: { level: warn }", |key| {
            match key {
                "STATESAVER_DB_PATH" => Some("/tmp/other.sqlite".to_owned()),
                "STATESAVER_LOG_LEVEL" => Some("trace".to_owned()),
                _ => None,
            }
        })
        .unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/tmp/other.sqlite"));
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn unknown_provider_in_env_is_rejected() {
        let err = StateSaverConfig::parse_with_env("", |key| {
            (key == "STATESAVER_PROVIDER").then(|| "cloud".to_owned())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn drain_timeout_shorter_than_poll_is_rejected() {
        let yaml = "swap: { drain_timeout_ms: 10, drain_poll_interval_ms: 100 }";
        let err = StateSaverConfig::parse_with_env(yaml, no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = StateSaverConfig::parse_with_env("storage: { max_connections: 0 }", no_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_yaml_is_a_yaml_error() {
        let err = StateSaverConfig::parse_with_env("storage: [", no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }

    #[test]
    fn configured_classifications_extend_defaults() {
        let config = StateSaverConfig::parse_with_env("classifications: { a-h: 3 }", no_env)
            .unwrap();
        let registry = config.registry();
        assert_eq!(registry.lookup("a-h-G"), 3);
        assert_eq!(registry.lookup("b-m-r"), 2);
    }
}
