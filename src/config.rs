use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::providers::{gemini, openai};
use crate::resilience::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub google_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub queue_capacity: usize,
    pub consumer_concurrency: usize,
    pub max_deliveries: u32,
    pub retry: RetryPolicy,
    pub breaker_threshold: u32,
    pub breaker_open_for: Duration,
    pub job_ttl: Duration,
    pub gc_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_in(&get, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts, 1..=20)?,
            base_delay: Duration::from_millis(parse_in(&get, "RETRY_BASE_MS", 500, 0..=HOUR_MS)?),
            max_delay: Duration::from_millis(parse_in(&get, "RETRY_MAX_MS", 30_000, 0..=HOUR_MS)?),
            jitter: retry_defaults.jitter,
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string()),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| openai::DEFAULT_MODEL.to_string()),
            google_api_key: required("GOOGLE_API_KEY")?,
            gemini_base_url: get("GEMINI_BASE_URL")
                .unwrap_or_else(|| gemini::DEFAULT_BASE_URL.to_string()),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| gemini::DEFAULT_MODEL.to_string()),
            queue_capacity: parse_in(&get, "QUEUE_CAPACITY", 256, 1..=1_000_000)?,
            consumer_concurrency: parse_in(&get, "CONSUMER_CONCURRENCY", 4, 1..=1024)?,
            max_deliveries: parse_in(&get, "MAX_DELIVERIES", 3, 1..=100)?,
            retry,
            breaker_threshold: parse_in(&get, "BREAKER_THRESHOLD", 5, 1..=10_000)?,
            breaker_open_for: Duration::from_secs(parse_in(
                &get,
                "BREAKER_OPEN_SECS",
                30,
                1..=DAY_SECS,
            )?),
            job_ttl: Duration::from_secs(parse_in(
                &get,
                "JOB_TTL_SECS",
                DAY_SECS,
                1..=365 * DAY_SECS,
            )?),
            gc_interval: Duration::from_secs(parse_in(&get, "GC_INTERVAL_SECS", 60, 1..=DAY_SECS)?),
            max_upload_bytes: parse_in(
                &get,
                "MAX_UPLOAD_BYTES",
                10 * 1024 * 1024,
                1..=512 * 1024 * 1024,
            )?,
        })
    }
}

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_SECS: u64 = 60 * 60 * 24;

/// Parses `name` if set, rejecting values outside `range`.
fn parse_in<T, G>(
    get: &G,
    name: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(name) else {
        return Ok(default);
    };
    match raw.trim().parse() {
        Ok(value) if range.contains(&value) => Ok(value),
        _ => Err(ConfigError::Invalid { name, value: raw }),
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
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[("OPENAI_API_KEY", "o"), ("GOOGLE_API_KEY", "g")]))
                .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.job_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_deliveries, 3);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_missing_keys() {
        let err = Config::from_lookup(lookup(&[("GOOGLE_API_KEY", "g")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPENAI_API_KEY")));

        let err = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "o"), ("GOOGLE_API_KEY", " ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GOOGLE_API_KEY")));
    }

    #[test]
    fn test_overrides_and_invalid_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "o"),
            ("GOOGLE_API_KEY", "g"),
            ("CONSUMER_CONCURRENCY", "8"),
            ("RETRY_BASE_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.consumer_concurrency, 8);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));

        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "o"),
            ("GOOGLE_API_KEY", "g"),
            ("JOB_TTL_SECS", "a day"),
        ]))
        .unwrap_err();
        assert_eq!(err.to_string(), "JOB_TTL_SECS has invalid value \"a day\"");
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for (name, value) in [
            ("JOB_TTL_SECS", "18446744073709551615"),
            ("MAX_UPLOAD_BYTES", "18446744073709551615"),
            ("CONSUMER_CONCURRENCY", "0"),
            ("QUEUE_CAPACITY", "0"),
            ("RETRY_MAX_MS", "99999999999"),
        ] {
            let err = Config::from_lookup(lookup(&[
                ("OPENAI_API_KEY", "o"),
                ("GOOGLE_API_KEY", "g"),
                (name, value),
            ]))
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == name),
                "{}",
                name
            );
        }
    }
}
