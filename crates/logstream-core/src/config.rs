//! Stream configuration loaded from TOML
//!
//! Every key has a default, unknown keys are rejected, and ranges are
//! checked by [`StreamConfig::validate`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::DEFAULT_CAPACITY;
use crate::notify::NotificationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration of a stream session
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub buffer: BufferConfig,
    pub reconnect: ReconnectConfig,
    pub rate: RateConfig,
    pub notifications: NotificationConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Number of most recent log events kept for display
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Automatic reconnection with capped exponential backoff
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Give up on a handshake that has not completed in this time
    pub handshake_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateConfig {
    pub interval_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

impl RateConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl StreamConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content, path)
    }

    /// Parse and validate TOML content
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(ConfigError::invalid("buffer.capacity", "must be at least 1"));
        }

        let reconnect = &self.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "reconnect.max_attempts",
                "must be at least 1",
            ));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigError::invalid(
                "reconnect.initial_delay_ms",
                format!(
                    "{} exceeds reconnect.max_delay_ms ({})",
                    reconnect.initial_delay_ms, reconnect.max_delay_ms
                ),
            ));
        }

        if reconnect.handshake_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "reconnect.handshake_timeout_ms",
                "must be at least 1",
            ));
        }

        if self.rate.interval_ms < 100 {
            return Err(ConfigError::invalid(
                "rate.interval_ms",
                "must be at least 100",
            ));
        }

        self.notifications.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logstream_types::LogLevel;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = StreamConfig::from_toml_str("").unwrap();
        assert_eq!(config, StreamConfig::default());
        assert_eq!(config.buffer.capacity, 500);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.notifications.levels, vec![LogLevel::Fatal]);
    }

    #[test]
    fn test_partial_sections() {
        let config = StreamConfig::from_toml_str(
            r#"
            [buffer]
            capacity = 50

            [reconnect]
            max_attempts = 2
            handshake_timeout_ms = 2500

            [notifications]
            volume = 0.25
            levels = ["critical", "FATAL"]
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.capacity, 50);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.handshake_timeout(), Duration::from_millis(2_500));
        assert!(config.reconnect.enabled);
        assert_eq!(config.notifications.volume, 0.25);
        assert_eq!(
            config.notifications.levels,
            vec![LogLevel::Critical, LogLevel::Fatal]
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = StreamConfig::from_toml_str("[notifications]\nloudness = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let err = StreamConfig::from_toml_str("[notifications]\nvolume = 1.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "notifications.volume",
                ..
            }
        ));

        let err = StreamConfig::from_toml_str("[buffer]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "buffer.capacity", .. }));

        let err = StreamConfig::from_toml_str(
            "[reconnect]\ninitial_delay_ms = 9000\nmax_delay_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = StreamConfig::from_toml_str("[rate]\ninterval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "rate.interval_ms", .. }));

        let err = StreamConfig::from_toml_str("[reconnect]\nhandshake_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "reconnect.handshake_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ReconnectConfig::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(5_000));
    }

    #[test]
    fn test_missing_file() {
        let err = StreamConfig::load("/nonexistent/logstream.toml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
