use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Tuning knobs for one conversation's sync engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base delay between gap-filling poll ticks
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Relative jitter applied to every poll delay, in `[0, 1)`
    pub poll_jitter: f64,
    /// Max messages fetched by a single poll tick
    pub poll_batch_limit: usize,
    /// Refresh the other participant's read marker every N poll ticks (0 disables)
    pub read_marker_poll_every: u32,
    /// History page size
    pub page_size: usize,
    /// Outgoing messages are truncated to this many characters
    pub max_message_chars: usize,
    /// Window in which `mark_read` calls collapse into one write
    #[serde(with = "duration_ms")]
    pub read_debounce: Duration,
    /// Upper bound on any single remote call
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            poll_jitter: 0.1,
            poll_batch_limit: 100,
            read_marker_poll_every: 10,
            page_size: 30,
            max_message_chars: 2_000,
            read_debounce: Duration::from_millis(1_000),
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

impl SyncConfig {
    /// Load from `CHAT_SYNC_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            poll_interval: env_millis("CHAT_SYNC_POLL_INTERVAL_MS", defaults.poll_interval)?,
            poll_jitter: env_parse("CHAT_SYNC_POLL_JITTER", defaults.poll_jitter)?,
            poll_batch_limit: env_parse("CHAT_SYNC_POLL_BATCH_LIMIT", defaults.poll_batch_limit)?,
            read_marker_poll_every: env_parse(
                "CHAT_SYNC_READ_MARKER_POLL_EVERY",
                defaults.read_marker_poll_every,
            )?,
            page_size: env_parse("CHAT_SYNC_PAGE_SIZE", defaults.page_size)?,
            max_message_chars: env_parse(
                "CHAT_SYNC_MAX_MESSAGE_CHARS",
                defaults.max_message_chars,
            )?,
            read_debounce: env_millis("CHAT_SYNC_READ_DEBOUNCE_MS", defaults.read_debounce)?,
            request_timeout: env_millis("CHAT_SYNC_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", &self.poll_interval));
        }
        if !(0.0..1.0).contains(&self.poll_jitter) {
            return Err(invalid("poll_jitter", &self.poll_jitter));
        }
        if self.poll_batch_limit == 0 {
            return Err(invalid("poll_batch_limit", &self.poll_batch_limit));
        }
        if self.page_size == 0 {
            return Err(invalid("page_size", &self.page_size));
        }
        if self.max_message_chars == 0 {
            return Err(invalid("max_message_chars", &self.max_message_chars));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout", &self.request_timeout));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: &dyn std::fmt::Debug) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: format!("{:?}", value),
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.max_message_chars, 2_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "page_size", .. })
        ));

        let config = SyncConfig {
            poll_jitter: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "poll_jitter", .. })
        ));
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"poll_interval": 500, "page_size": 10}"#).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.page_size, 10);
        assert_eq!(config.read_debounce, Duration::from_millis(1_000));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        env::set_var("CHAT_SYNC_PAGE_SIZE", "12");
        env::set_var("CHAT_SYNC_READ_DEBOUNCE_MS", "250");
        let config = SyncConfig::from_env().unwrap();
        env::remove_var("CHAT_SYNC_PAGE_SIZE");
        env::remove_var("CHAT_SYNC_READ_DEBOUNCE_MS");

        assert_eq!(config.page_size, 12);
        assert_eq!(config.read_debounce, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        env::set_var("CHAT_SYNC_POLL_BATCH_LIMIT", "lots");
        let result = SyncConfig::from_env();
        env::remove_var("CHAT_SYNC_POLL_BATCH_LIMIT");

        assert_eq!(
            result,
            Err(ConfigError::Invalid {
                key: "CHAT_SYNC_POLL_BATCH_LIMIT",
                value: "lots".to_string(),
            })
        );
    }
}
