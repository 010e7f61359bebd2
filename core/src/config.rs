//! Executor settings.
//!
//! Values come from defaults, a JSON document, or `CLOUDHTTP_*` environment
//! variables. Unknown or unparseable environment values fall back to the
//! default rather than failing.

use std::time::Duration;

use serde::Deserialize;

use crate::error::HttpError;

pub const DEFAULT_USER_AGENT: &str = concat!("cloudhttp/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Attempts allowed after the first failure, for IO errors and for
    /// retryable statuses.
    pub max_retries: u32,
    /// First backoff step; later steps grow with the square of the failure
    /// count, capped at ten times this value.
    pub retry_delay_start_ms: u64,
    pub max_redirects: u32,
    /// Commands allowed to run concurrently.
    pub io_worker_threads: usize,
    pub connection_timeout_ms: u64,
    pub so_timeout_ms: u64,
    pub wire_log: bool,
    /// Files and streams above this many bytes are teed rather than buffered.
    pub wire_buffer_threshold: u64,
    pub user_agent: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_start_ms: 50,
            max_redirects: 5,
            io_worker_threads: 20,
            connection_timeout_ms: 60_000,
            so_timeout_ms: 60_000,
            wire_log: false,
            wire_buffer_threshold: 64 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(json: &str) -> Result<Self, HttpError> {
        serde_json::from_str(json).map_err(|e| HttpError::InvalidRequest(format!("invalid executor config: {e}")))
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            max_retries: parse("CLOUDHTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_delay_start_ms: parse("CLOUDHTTP_RETRY_DELAY_START_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retry_delay_start_ms),
            max_redirects: parse("CLOUDHTTP_MAX_REDIRECTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_redirects),
            io_worker_threads: parse("CLOUDHTTP_IO_WORKER_THREADS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.io_worker_threads),
            connection_timeout_ms: parse("CLOUDHTTP_CONNECTION_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connection_timeout_ms),
            so_timeout_ms: parse("CLOUDHTTP_SO_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.so_timeout_ms),
            wire_log: parse("CLOUDHTTP_WIRE_LOG")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.wire_log),
            wire_buffer_threshold: parse("CLOUDHTTP_WIRE_BUFFER_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.wire_buffer_threshold),
            user_agent: parse("CLOUDHTTP_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn retry_delay_start(&self) -> Duration {
        Duration::from_millis(self.retry_delay_start_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn so_timeout(&self) -> Duration {
        Duration::from_millis(self.so_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay_start(), Duration::from_millis(50));
        assert_eq!(config.max_redirects, 5);
        assert!(!config.wire_log);
        assert!(config.user_agent.starts_with("cloudhttp/"));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = ExecutorConfig::from_json(r#"{"max_retries": 2, "wire_log": true}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert!(config.wire_log);
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn json_with_wrong_types_is_rejected() {
        let err = ExecutorConfig::from_json(r#"{"max_retries": "many"}"#).unwrap_err();
        assert!(matches!(err, HttpError::InvalidRequest(_)));
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("CLOUDHTTP_MAX_RETRIES", "1"),
            ("CLOUDHTTP_WIRE_LOG", "TRUE"),
            ("CLOUDHTTP_MAX_REDIRECTS", "lots"),
            ("CLOUDHTTP_IO_WORKER_THREADS", "0"),
            ("CLOUDHTTP_USER_AGENT", ""),
        ]
        .into_iter()
        .collect();
        let config = ExecutorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_retries, 1);
        assert!(config.wire_log);
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.io_worker_threads, 20);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }
}
