//! Builder pattern for configuring a cache

use crate::cache::Cache;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default name of the background purge thread
pub const DEFAULT_THREAD_NAME: &str = "keymemo-purge";

/// Serializable cache settings
///
/// ```json
/// { "purge_interval_ms": 30000, "thread_name": "sessions-purge" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Interval between whole-cache purges; zero disables purging
    #[serde(rename = "purge_interval_ms", with = "millis")]
    pub purge_interval: Duration,
    /// Name given to the purge thread
    pub thread_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_interval: Duration::ZERO,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration builder for [`Cache`]
#[derive(Debug, Clone, Default)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl CacheBuilder {
    /// Creates a new builder with purging disabled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    #[must_use]
    pub const fn from_config(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Purge the whole cache every `interval` (zero disables purging)
    #[must_use]
    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.config.purge_interval = interval;
        self
    }

    /// Disable periodic purging
    #[must_use]
    pub fn no_purge(mut self) -> Self {
        self.config.purge_interval = Duration::ZERO;
        self
    }

    /// Set the purge thread name
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// The configuration built so far
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build the cache, starting the purge thread if an interval is set
    ///
    /// # Errors
    ///
    /// Returns an error if the thread name is empty or contains a NUL byte, or if the
    /// purge thread cannot be spawned
    pub fn build<V>(self) -> Result<Cache<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let name = &self.config.thread_name;
        if name.is_empty() {
            return Err(Error::configuration("purge thread name must not be empty"));
        }
        if name.contains('\0') {
            return Err(Error::configuration(
                "purge thread name must not contain NUL bytes",
            ));
        }
        Cache::with_config(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.purge_interval, Duration::ZERO);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
    }

    #[test]
    fn test_builder_settings() {
        let builder = CacheBuilder::new()
            .purge_interval(Duration::from_secs(30))
            .thread_name("sessions-purge");
        assert_eq!(builder.config().purge_interval, Duration::from_secs(30));
        assert_eq!(builder.config().thread_name, "sessions-purge");

        let builder = builder.no_purge();
        assert_eq!(builder.config().purge_interval, Duration::ZERO);
    }

    #[test]
    fn test_config_from_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"purge_interval_ms": 1500, "thread_name": "p"}"#).unwrap();
        assert_eq!(config.purge_interval, Duration::from_millis(1500));
        assert_eq!(config.thread_name, "p");

        let partial: CacheConfig = serde_json::from_str(r#"{"purge_interval_ms": 10}"#).unwrap();
        assert_eq!(partial.thread_name, DEFAULT_THREAD_NAME);
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let result = serde_json::from_str::<CacheConfig>(r#"{"ttl": 5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_roundtrip_uses_millis() {
        let config = CacheConfig {
            purge_interval: Duration::from_secs(2),
            ..CacheConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["purge_interval_ms"], 2000);
    }

    #[test]
    fn test_build_rejects_bad_thread_names() {
        let err = CacheBuilder::new().thread_name("").build::<u8>().unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        let err = CacheBuilder::new().thread_name("a\0b").build::<u8>().unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn test_build_from_config() {
        let config = CacheConfig {
            purge_interval: Duration::from_secs(60),
            thread_name: "from-config".to_string(),
        };
        let cache = CacheBuilder::from_config(config).build::<String>().unwrap();
        assert_eq!(cache.purge_interval(), Some(Duration::from_secs(60)));
        cache.stop().unwrap();
    }
}
