//! Configuration for the engine.

use std::time::Duration;

use anyhow::{Context, Result};
use tend_id::Namespace;
use tend_reconcile::BackoffPolicy;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace used for deployed objects that carry none.
    pub default_namespace: Namespace,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit diagnostics as JSON instead of human-readable lines.
    pub log_json: bool,

    /// How often an open pod log stream is checked for staleness.
    pub pod_log_health_check: Duration,

    /// How far past its last read a stale log stream resumes.
    pub pod_log_reconnect_gap: Duration,

    /// Retry policy for port-forward sessions.
    pub port_forward_backoff: BackoffPolicy,

    /// Maximum number of entries kept in the in-memory log store.
    pub log_store_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_namespace: Namespace::new("default"),
            log_level: "info".to_string(),
            log_json: false,
            pod_log_health_check: Duration::from_secs(15),
            pod_log_reconnect_gap: Duration::from_secs(2),
            port_forward_backoff: BackoffPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_secs(15),
                jitter: 0.1,
            },
            log_store_max_entries: 10_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to [`EngineConfig::default`]. Set but
    /// malformed values are rejected.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let default_namespace = match std::env::var("TEND_NAMESPACE") {
            Ok(ns) => Namespace::parse(&ns).context("invalid TEND_NAMESPACE")?,
            Err(_) => defaults.default_namespace,
        };

        let log_level = std::env::var("TEND_LOG_LEVEL").unwrap_or(defaults.log_level);

        let log_json = env_parse("TEND_LOG_JSON")?.unwrap_or(defaults.log_json);

        let pod_log_health_check = env_parse("TEND_POD_LOG_HEALTH_CHECK_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.pod_log_health_check);

        let pod_log_reconnect_gap = env_parse("TEND_POD_LOG_RECONNECT_GAP_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.pod_log_reconnect_gap);

        let backoff_base = env_parse("TEND_PORT_FORWARD_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.port_forward_backoff.base);

        let backoff_max = env_parse("TEND_PORT_FORWARD_BACKOFF_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.port_forward_backoff.max);

        let backoff_jitter: f64 = env_parse("TEND_PORT_FORWARD_BACKOFF_JITTER")?
            .unwrap_or(defaults.port_forward_backoff.jitter);
        if !(0.0..=1.0).contains(&backoff_jitter) {
            anyhow::bail!("TEND_PORT_FORWARD_BACKOFF_JITTER must be between 0 and 1");
        }

        let log_store_max_entries =
            env_parse("TEND_LOG_STORE_MAX_ENTRIES")?.unwrap_or(defaults.log_store_max_entries);

        Ok(Self {
            default_namespace,
            log_level,
            log_json,
            pod_log_health_check,
            pod_log_reconnect_gap,
            port_forward_backoff: BackoffPolicy {
                base: backoff_base,
                max: backoff_max,
                jitter: backoff_jitter,
            },
            log_store_max_entries,
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_namespace.as_str(), "default");
        assert_eq!(config.pod_log_health_check, Duration::from_secs(15));
        assert_eq!(config.pod_log_reconnect_gap, Duration::from_secs(2));
        assert_eq!(config.port_forward_backoff.base, Duration::from_millis(50));
        assert_eq!(config.port_forward_backoff.max, Duration::from_secs(15));
        assert!(!config.log_json);
    }

    #[test]
    fn test_env_parse_missing() {
        let value: Option<u64> = env_parse("TEND_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(value.is_none());
    }
}
