//! Discovery Configuration
//!
//! Centralized configuration for the discovery client with environment
//! variable overrides.

use crate::error::{DiscoveryError, Result};
use beacon_core::KeyParsePolicy;
use std::time::Duration;

/// Discovery configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    // Store connection
    /// Etcd endpoints (env: BEACON_ETCD_ENDPOINTS, comma-separated)
    pub endpoints: Vec<String>,

    /// Key namespace every name is formatted under (env: BEACON_NAMESPACE)
    pub namespace: String,

    /// Timeout for establishing a store connection
    pub connect_timeout: Duration,

    /// Bound applied to every individual store call (env: BEACON_REQUEST_TIMEOUT_MS)
    pub request_timeout: Duration,

    // Registration
    /// TTL used when a caller passes a non-positive one (seconds)
    pub default_lease_ttl: i64,

    /// Interval of the registration supervisor loop
    pub supervisor_tick: Duration,

    // Watch
    /// Capacity of each subscription's output channel (env: BEACON_WATCH_BUFFER)
    pub watch_buffer: usize,

    /// Handling of malformed keys on delete events (env: BEACON_KEY_PARSE_POLICY)
    pub key_parse_policy: KeyParsePolicy,

    // Connect backoff
    /// Initial interval for store connection retry
    pub backoff_initial: Duration,

    /// Maximum interval for store connection retry
    pub backoff_max: Duration,

    /// Maximum elapsed time for store connection retries
    pub backoff_max_elapsed: Duration,

    /// Multiplier for connect backoff
    pub backoff_multiplier: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            namespace: "/beacon".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),

            default_lease_ttl: 7,
            supervisor_tick: Duration::from_secs(1),

            watch_buffer: 64,
            key_parse_policy: KeyParsePolicy::Tolerant,

            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl DiscoveryConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("BEACON_ETCD_ENDPOINTS") {
            config.endpoints = parse_endpoints(&endpoints);
        }

        if let Ok(namespace) = std::env::var("BEACON_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Ok(timeout) = std::env::var("BEACON_REQUEST_TIMEOUT_MS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                config.request_timeout = Duration::from_millis(parsed);
            }
        }

        if let Ok(buffer) = std::env::var("BEACON_WATCH_BUFFER") {
            if let Ok(parsed) = buffer.parse::<usize>() {
                config.watch_buffer = parsed;
            }
        }

        if let Ok(policy) = std::env::var("BEACON_KEY_PARSE_POLICY") {
            if let Ok(parsed) = policy.parse() {
                config.key_parse_policy = parsed;
            }
        }

        config
    }

    /// Reject configurations that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::Config("endpoint list is empty".into()));
        }
        if self.watch_buffer == 0 {
            return Err(DiscoveryError::Config("watch buffer must be non-zero".into()));
        }
        if self.supervisor_tick.is_zero() {
            return Err(DiscoveryError::Config("supervisor tick must be non-zero".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(DiscoveryError::Config("request timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Lease TTL to request for a caller-supplied value.
    pub fn effective_ttl(&self, ttl: i64) -> i64 {
        if ttl > 0 {
            ttl
        } else {
            self.default_lease_ttl
        }
    }
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_lease_ttl, 7);
        assert_eq!(config.supervisor_tick, Duration::from_secs(1));
    }

    #[test]
    fn test_empty_endpoints_rejected() {
        let config = DiscoveryConfig {
            endpoints: parse_endpoints(" , ,"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DiscoveryError::Config(_))));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = DiscoveryConfig {
            watch_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_ttl() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.effective_ttl(0), 7);
        assert_eq!(config.effective_ttl(-4), 7);
        assert_eq!(config.effective_ttl(30), 30);
    }

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("http://a:2379, http://b:2379"),
            vec!["http://a:2379", "http://b:2379"]
        );
    }
}
