//! Client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use lao_state::{QuorumPolicy, StoreConfig};

use crate::ConfigError;

pub const ENV_REQUEST_TIMEOUT: &str = "LAO_REQUEST_TIMEOUT";
pub const ENV_ORPHAN_HORIZON: &str = "LAO_ORPHAN_HORIZON";
pub const ENV_MAX_ORPHANS: &str = "LAO_MAX_ORPHANS";
pub const ENV_MAX_REPROCESSING: &str = "LAO_MAX_REPROCESSING";
pub const ENV_QUORUM: &str = "LAO_QUORUM";

/// LAO client configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout applied to every relay request
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
    /// How long a witness may wait for its target
    #[serde(with = "humantime_duration")]
    pub orphan_horizon: Duration,
    pub max_orphans_per_channel: usize,
    /// Retries for envelopes whose entity is not yet known
    pub max_reprocessing: u32,
    pub quorum: QuorumPolicy,
    /// Capacity of the snapshot update channel
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            orphan_horizon: Duration::from_secs(300),
            max_orphans_per_channel: 256,
            max_reprocessing: 5,
            quorum: QuorumPolicy::AllWitnesses,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_orphan_horizon(mut self, horizon: Duration) -> Self {
        self.orphan_horizon = horizon;
        self
    }

    pub fn with_max_orphans_per_channel(mut self, max: usize) -> Self {
        self.max_orphans_per_channel = max;
        self
    }

    pub fn with_max_reprocessing(mut self, attempts: u32) -> Self {
        self.max_reprocessing = attempts;
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Settings handed to the reconciliation store
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            quorum: self.quorum,
            orphan_horizon: self.orphan_horizon,
            max_orphans_per_channel: self.max_orphans_per_channel,
        }
    }

    /// Defaults overlaid with `LAO_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, leaving unset keys untouched
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT) {
            self.request_timeout = parse_duration(ENV_REQUEST_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_ORPHAN_HORIZON) {
            self.orphan_horizon = parse_duration(ENV_ORPHAN_HORIZON, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ORPHANS) {
            self.max_orphans_per_channel = parse_number(ENV_MAX_ORPHANS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_REPROCESSING) {
            self.max_reprocessing = parse_number(ENV_MAX_REPROCESSING, &value)?;
        }
        if let Some(value) = lookup(ENV_QUORUM) {
            self.quorum = value.trim().parse().map_err(|reason| ConfigError::Invalid {
                key: ENV_QUORUM,
                value: value.clone(),
                reason,
            })?;
        }
        Ok(self)
    }
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Durations as humantime strings, e.g. `"5s"` or `"2m 30s"`
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.orphan_horizon, Duration::from_secs(300));
        assert_eq!(config.max_reprocessing, 5);
        assert_eq!(config.quorum, QuorumPolicy::AllWitnesses);
        assert_eq!(config.store_config(), StoreConfig::default());
    }

    #[test]
    fn test_overlay() {
        let config = ClientConfig::default()
            .overlay(lookup(&[
                (ENV_REQUEST_TIMEOUT, "1500ms"),
                (ENV_ORPHAN_HORIZON, "2m"),
                (ENV_MAX_ORPHANS, "16"),
                (ENV_QUORUM, "majority"),
            ]))
            .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.orphan_horizon, Duration::from_secs(120));
        assert_eq!(config.max_orphans_per_channel, 16);
        assert_eq!(config.max_reprocessing, 5);
        assert_eq!(config.quorum, QuorumPolicy::Majority);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = ClientConfig::default()
            .overlay(lookup(&[(ENV_MAX_REPROCESSING, "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: ENV_MAX_REPROCESSING, .. }
        ));

        let err = ClientConfig::default()
            .overlay(lookup(&[(ENV_QUORUM, "1.5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_QUORUM, .. }));
    }

    #[test]
    fn test_serde_humantime() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"request_timeout": "250ms", "quorum": "majority"}"#).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.orphan_horizon, Duration::from_secs(300));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["request_timeout"], "250ms");
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var(ENV_REQUEST_TIMEOUT, "10s");
        std::env::set_var(ENV_QUORUM, "0.5");
        let config = ClientConfig::from_env();
        std::env::remove_var(ENV_REQUEST_TIMEOUT);
        std::env::remove_var(ENV_QUORUM);

        let config = config.unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.quorum, QuorumPolicy::Fraction(0.5));
    }

    #[test]
    #[serial]
    fn test_from_env_unset() {
        std::env::remove_var(ENV_REQUEST_TIMEOUT);
        assert_eq!(ClientConfig::from_env().unwrap(), ClientConfig::default());
    }
}
