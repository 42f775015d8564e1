//! Queue configuration
//!
//! Settings are read once at process start from `QUEUE_*` environment
//! variables. There is no runtime hot-swap of the backend.
//!
//! ```bash
//! export QUEUE_DURABLE_ENABLED=true
//! export QUEUE_REDIS_URL=redis://cache:6379
//! ```

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::retry::BackoffPolicy;

/// Process-wide queue settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Use the durable broker-backed adapter instead of the embedded engine
    pub durable: bool,
    pub redis_url: String,
    pub key_prefix: String,
    pub connect_timeout: Duration,
    /// Attempts before a job is dead-lettered
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Durable worker concurrency per job name
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            durable: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "dog-jobs".to_string(),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            worker_concurrency: 5,
            poll_interval: Duration::from_millis(100),
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl QueueSettings {
    /// Load settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            durable: lookup("QUEUE_DURABLE_ENABLED")
                .map(|raw| parse_flag("QUEUE_DURABLE_ENABLED", &raw, defaults.durable))
                .unwrap_or(defaults.durable),
            redis_url: lookup("QUEUE_REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: lookup("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            connect_timeout: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout.as_millis() as u64,
            )),
            max_retries: parse_or(&lookup, "QUEUE_MAX_RETRIES", defaults.max_retries),
            base_delay: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            worker_concurrency: parse_or(&lookup, "QUEUE_WORKER_CONCURRENCY", defaults.worker_concurrency).max(1),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "QUEUE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            keep_completed: parse_or(&lookup, "QUEUE_KEEP_COMPLETED", defaults.keep_completed),
            keep_failed: parse_or(&lookup, "QUEUE_KEEP_FAILED", defaults.keep_failed),
        }
    }

    /// Configuration for the embedded engine
    pub fn embedded(&self) -> EmbeddedConfig {
        EmbeddedConfig {
            max_retries: self.max_retries,
            backoff: BackoffPolicy::exponential(self.base_delay),
        }
    }

    /// Configuration for the durable adapter and its broker
    pub fn durable(&self) -> DurableConfig {
        DurableConfig {
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
            connect_timeout: self.connect_timeout,
            attempts: self.max_retries,
            backoff: BackoffPolicy::exponential(self.base_delay),
            concurrency: self.worker_concurrency,
            poll_interval: self.poll_interval,
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

/// Embedded engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedConfig {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        QueueSettings::default().embedded()
    }
}

/// Durable adapter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub connect_timeout: Duration,
    /// Total attempts the broker makes before failing a job
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for DurableConfig {
    fn default() -> Self {
        QueueSettings::default().durable()
    }
}

fn parse_flag(key: &str, raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            warn!(key, value = raw, "Invalid boolean setting, using default");
            default
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid numeric setting, using default");
            default
        }),
        None => default,
    }
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
    fn test_defaults_select_embedded() {
        let settings = QueueSettings::from_lookup(lookup(&[]));
        assert_eq!(settings, QueueSettings::default());
        assert!(!settings.durable);
        assert_eq!(settings.embedded().max_retries, 3);
        assert_eq!(settings.embedded().backoff.base, Duration::from_millis(2000));
    }

    #[test]
    fn test_flag_and_overrides() {
        let settings = QueueSettings::from_lookup(lookup(&[
            ("QUEUE_DURABLE_ENABLED", "TRUE"),
            ("QUEUE_REDIS_URL", "redis://cache:6379"),
            ("QUEUE_MAX_RETRIES", "5"),
            ("QUEUE_BASE_DELAY_MS", "250"),
            ("QUEUE_WORKER_CONCURRENCY", "0"),
        ]));
        assert!(settings.durable);
        assert_eq!(settings.redis_url, "redis://cache:6379");
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.base_delay, Duration::from_millis(250));
        assert_eq!(settings.worker_concurrency, 1);

        let durable = settings.durable();
        assert_eq!(durable.attempts, 5);
        assert_eq!(durable.backoff.delay_for(1), Duration::from_millis(500));
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let settings = QueueSettings::from_lookup(lookup(&[
            ("QUEUE_DURABLE_ENABLED", "maybe"),
            ("QUEUE_MAX_RETRIES", "three"),
        ]));
        assert!(!settings.durable);
        assert_eq!(settings.max_retries, 3);
    }
}
