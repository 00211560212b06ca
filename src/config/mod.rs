//! Service configuration.
//!
//! Every field has a default, so an absent file, an empty file, or a file that
//! sets a single key are all valid. Durations are written the humantime way
//! (`90s`, `10m`, `24h`).
//!
//! ```toml
//! bind_address = "127.0.0.1:8080"
//!
//! [cache]
//! record_ttl = "5m"
//! max_entries = 10000
//!
//! [rate_limit]
//! burst = 20
//! fail_mode = "closed"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::security::rate_limit::FailMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Response cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How long a successful response stays servable.
    #[serde(with = "humantime_serde")]
    pub record_ttl: Duration,

    /// Idle period after which a coalescing group is released. `0s` keeps a
    /// group exactly as long as its computation.
    #[serde(with = "humantime_serde")]
    pub forget_after: Duration,

    /// Period of the background sweep of expired store entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on store entries; unbounded when absent.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(10 * 60),
            forget_after: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(60),
            max_entries: None,
        }
    }
}

/// Per-client token bucket settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests a client may make back to back.
    pub burst: u32,

    /// Time to earn back one request.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Idle time after which a client's bucket is dropped. Also sent as
    /// `Retry-After`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    pub fail_mode: FailMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            interval: Duration::from_secs(1),
            ttl: Duration::from_secs(60),
            fail_mode: FailMode::default(),
        }
    }
}

/// Upstream feed settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// How long compiled filter patterns are kept.
    #[serde(with = "humantime_serde")]
    pub pattern_ttl: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(90),
            pattern_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind_address: String,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub feed: FeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_owned(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl Config {
    /// Loads the file at `path`, or the defaults when there is none.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.bind_address.trim().is_empty() {
            return invalid("bind_address must not be empty");
        }
        if self.cache.sweep_interval.is_zero() {
            return invalid("cache.sweep_interval must be positive");
        }
        if self.cache.max_entries == Some(0) {
            return invalid("cache.max_entries must be positive when set");
        }
        if self.rate_limit.burst == 0 {
            return invalid("rate_limit.burst must be positive");
        }
        if self.rate_limit.interval.is_zero() {
            return invalid("rate_limit.interval must be positive");
        }
        if self.rate_limit.ttl.is_zero() {
            return invalid("rate_limit.ttl must be positive");
        }
        if self.feed.fetch_timeout.is_zero() {
            return invalid("feed.fetch_timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.cache.record_ttl, Duration::from_secs(600));
        assert_eq!(config.cache.forget_after, Duration::from_secs(90));
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.rate_limit.ttl, Duration::from_secs(60));
        assert_eq!(config.rate_limit.fail_mode, FailMode::Open);
        assert_eq!(config.feed.pattern_ttl, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_file_is_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            bind_address = "127.0.0.1:9000"

            [cache]
            record_ttl = "5m"
            max_entries = 100

            [rate_limit]
            interval = "500ms"
            fail_mode = "closed"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.cache.record_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.max_entries, Some(100));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit.interval, Duration::from_millis(500));
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.rate_limit.fail_mode, FailMode::Closed);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::from_toml("[cache]\nrecord = \"1m\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(Config::from_toml("[feed]\nfetch_timeout = \"soon\"").is_err());
    }

    #[test]
    fn validation() {
        let mut config = Config::default();
        config.rate_limit.burst = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.cache.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.forget_after = Duration::ZERO;
        config.cache.record_ttl = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::get(Some(Path::new("/nonexistent/feedgate.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(Config::get(None).is_ok());
    }
}
