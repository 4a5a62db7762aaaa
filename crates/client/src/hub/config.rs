//! Push connection configuration.

use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const ENV_PUSH_URL: &str = "DRAFTSYNC_PUSH_URL";
pub const ENV_RETRY_DELAYS_MS: &str = "DRAFTSYNC_RETRY_DELAYS_MS";
pub const ENV_HEARTBEAT_TIMEOUT_MS: &str = "DRAFTSYNC_HEARTBEAT_TIMEOUT_MS";

/// Configuration for the push connection and its reconnect behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Push endpoint (ws:// or wss://).
    pub url: String,
    /// Backoff table in milliseconds. Attempt `n` waits
    /// `retry_delays_ms[min(n - 1, len - 1)]`; failing more often than the
    /// table is long puts the hub into degraded mode.
    pub retry_delays_ms: Vec<u64>,
    /// Silence on the channel longer than this counts as a dead connection.
    pub heartbeat_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/api/events".to_string(),
            retry_delays_ms: vec![1_000, 2_000, 5_000, 10_000],
            heartbeat_timeout_ms: 45_000,
        }
    }
}

impl HubConfig {
    /// Read configuration from environment variables, falling back to
    /// [`HubConfig::default`] for anything unset.
    ///
    /// Environment variables:
    /// - `DRAFTSYNC_PUSH_URL`: push endpoint
    /// - `DRAFTSYNC_RETRY_DELAYS_MS`: comma-separated delays, e.g. `1000,2000,5000`
    /// - `DRAFTSYNC_HEARTBEAT_TIMEOUT_MS`: watchdog timeout
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`HubConfig::from_env`] but skips [`HubConfig::validate`], for
    /// callers that layer their own overrides on top. Unparsable values are
    /// still rejected.
    pub fn read_env() -> Result<Self, ConfigError> {
        Self::read_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self::read_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn read_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_PUSH_URL) {
            config.url = url;
        }

        if let Some(raw) = lookup(ENV_RETRY_DELAYS_MS) {
            config.retry_delays_ms = parse_delays(&raw).ok_or(ConfigError::InvalidEnv {
                key: ENV_RETRY_DELAYS_MS,
                value: raw,
            })?;
        }

        if let Some(raw) = lookup(ENV_HEARTBEAT_TIMEOUT_MS) {
            config.heartbeat_timeout_ms =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_HEARTBEAT_TIMEOUT_MS,
                    value: raw.clone(),
                })?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_delays_ms.is_empty() {
            return Err(ConfigError::EmptyRetryDelays);
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::ZeroHeartbeatTimeout);
        }

        let parsed = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based). The last entry repeats
    /// once the table is exhausted.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let Some(last) = self.retry_delays_ms.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        Duration::from_millis(self.retry_delays_ms[index])
    }

    /// Number of failures tolerated before the hub degrades.
    pub fn backoff_len(&self) -> u32 {
        self.retry_delays_ms.len() as u32
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

fn parse_delays(raw: &str) -> Option<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn retry_delay_repeats_last_entry() {
        let config = HubConfig {
            retry_delays_ms: vec![100, 250, 1_000],
            ..HubConfig::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(250));
        assert_eq!(config.retry_delay(3), Duration::from_millis(1_000));
        assert_eq!(config.retry_delay(9), Duration::from_millis(1_000));
        // attempt 0 never happens in practice but must not underflow
        assert_eq!(config.retry_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn default_is_valid() {
        assert!(HubConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let empty = HubConfig {
            retry_delays_ms: vec![],
            ..HubConfig::default()
        };
        assert_eq!(empty.validate(), Err(ConfigError::EmptyRetryDelays));

        let zero = HubConfig {
            heartbeat_timeout_ms: 0,
            ..HubConfig::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroHeartbeatTimeout));

        let http = HubConfig {
            url: "https://example.com/events".to_string(),
            ..HubConfig::default()
        };
        assert!(matches!(http.validate(), Err(ConfigError::InvalidUrl { .. })));

        let garbage = HubConfig {
            url: "::not a url".to_string(),
            ..HubConfig::default()
        };
        assert!(matches!(garbage.validate(), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = HubConfig::from_lookup(lookup(&[
            (ENV_PUSH_URL, "wss://push.example.com/events"),
            (ENV_RETRY_DELAYS_MS, "5, 10 ,20"),
            (ENV_HEARTBEAT_TIMEOUT_MS, "3000"),
        ]))
        .unwrap();
        assert_eq!(config.url, "wss://push.example.com/events");
        assert_eq!(config.retry_delays_ms, vec![5, 10, 20]);
        assert_eq!(config.heartbeat_timeout_ms, 3_000);
    }

    #[test]
    fn env_rejects_unparsable_values() {
        let err = HubConfig::from_lookup(lookup(&[(ENV_RETRY_DELAYS_MS, "5,soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_RETRY_DELAYS_MS,
                value: "5,soon".to_string()
            }
        );

        let err = HubConfig::from_lookup(lookup(&[(ENV_RETRY_DELAYS_MS, " , ")])).unwrap_err();
        assert_eq!(err, ConfigError::EmptyRetryDelays);

        let err =
            HubConfig::from_lookup(lookup(&[(ENV_HEARTBEAT_TIMEOUT_MS, "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == ENV_HEARTBEAT_TIMEOUT_MS));
    }

    #[test]
    fn unvalidated_env_can_be_corrected_before_validation() {
        let mut config =
            HubConfig::read_lookup(lookup(&[(ENV_PUSH_URL, "http://wrong.example.com")])).unwrap();
        assert!(config.validate().is_err());

        config.url = "wss://push.example.com/events".to_string();
        assert!(config.validate().is_ok());

        let err = HubConfig::read_lookup(lookup(&[(ENV_HEARTBEAT_TIMEOUT_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == ENV_HEARTBEAT_TIMEOUT_MS));
    }
}
