// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::message::Destination;

/// Default script directory template. `{instrument}` is replaced by the instrument name.
pub const DEFAULT_SCRIPTS_DIR: &str = "/isis/NDX{instrument}/user/scripts/autoreduction";

/// Highest existing run version for which a failed run is still retried.
/// With versions starting at 0 this allows five attempts before giving up.
pub const DEFAULT_MAX_RETRY_VERSION: i32 = 4;

/// Queue processor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Script directory template
    pub scripts_dir: String,
    /// How often the consumer polls for due messages
    pub poll_interval: Duration,
    /// Maximum messages fetched per poll
    pub batch_size: i64,
    /// Highest run version that may still be retried
    pub max_retry_version: i32,
    /// Destination tags
    pub queues: QueueNames,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `AUTOREDUCE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `AUTOREDUCE_SCRIPTS_DIR`: script directory template (default: [`DEFAULT_SCRIPTS_DIR`])
    /// - `AUTOREDUCE_POLL_INTERVAL_MS`: consumer poll interval (default: 1000)
    /// - `AUTOREDUCE_BATCH_SIZE`: messages per poll (default: 10)
    /// - `AUTOREDUCE_MAX_RETRY_VERSION`: retry cut-off (default: 4)
    /// - `AUTOREDUCE_QUEUE_*`: destination tags, see [`QueueNames::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("AUTOREDUCE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("AUTOREDUCE_DATABASE_URL"))?;

        let scripts_dir = std::env::var("AUTOREDUCE_SCRIPTS_DIR")
            .unwrap_or_else(|_| DEFAULT_SCRIPTS_DIR.to_string());

        let poll_interval_ms: u64 = std::env::var("AUTOREDUCE_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("AUTOREDUCE_POLL_INTERVAL_MS", "must be a positive integer")
            })?;

        let batch_size: i64 = std::env::var("AUTOREDUCE_BATCH_SIZE")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "AUTOREDUCE_BATCH_SIZE",
                "must be a positive integer",
            ))?;

        let max_retry_version: i32 = std::env::var("AUTOREDUCE_MAX_RETRY_VERSION")
            .unwrap_or_else(|_| DEFAULT_MAX_RETRY_VERSION.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("AUTOREDUCE_MAX_RETRY_VERSION", "must be an integer"))?;

        Ok(Self {
            database_url,
            scripts_dir,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            max_retry_version,
            queues: QueueNames::from_env(),
        })
    }
}

/// Destination tags for every lifecycle queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Data ready tag
    pub data_ready: String,
    /// Reduction started tag
    pub reduction_started: String,
    /// Reduction complete tag
    pub reduction_complete: String,
    /// Reduction error tag
    pub reduction_error: String,
    /// Reduction skipped tag
    pub reduction_skipped: String,
    /// Reduction pending tag
    pub reduction_pending: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            data_ready: "/queue/DataReady".to_string(),
            reduction_started: "/queue/ReductionStarted".to_string(),
            reduction_complete: "/queue/ReductionComplete".to_string(),
            reduction_error: "/queue/ReductionError".to_string(),
            reduction_skipped: "/queue/ReductionSkipped".to_string(),
            reduction_pending: "/queue/ReductionPending".to_string(),
        }
    }
}

impl QueueNames {
    /// Read `AUTOREDUCE_QUEUE_DATA_READY`, `AUTOREDUCE_QUEUE_REDUCTION_STARTED`,
    /// `AUTOREDUCE_QUEUE_REDUCTION_COMPLETE`, `AUTOREDUCE_QUEUE_REDUCTION_ERROR`,
    /// `AUTOREDUCE_QUEUE_REDUCTION_SKIPPED` and `AUTOREDUCE_QUEUE_REDUCTION_PENDING`,
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |key: &str, default: String| std::env::var(key).unwrap_or(default);
        Self {
            data_ready: var("AUTOREDUCE_QUEUE_DATA_READY", defaults.data_ready),
            reduction_started: var(
                "AUTOREDUCE_QUEUE_REDUCTION_STARTED",
                defaults.reduction_started,
            ),
            reduction_complete: var(
                "AUTOREDUCE_QUEUE_REDUCTION_COMPLETE",
                defaults.reduction_complete,
            ),
            reduction_error: var("AUTOREDUCE_QUEUE_REDUCTION_ERROR", defaults.reduction_error),
            reduction_skipped: var(
                "AUTOREDUCE_QUEUE_REDUCTION_SKIPPED",
                defaults.reduction_skipped,
            ),
            reduction_pending: var(
                "AUTOREDUCE_QUEUE_REDUCTION_PENDING",
                defaults.reduction_pending,
            ),
        }
    }

    /// Tag for a destination.
    pub fn tag(&self, destination: Destination) -> &str {
        match destination {
            Destination::DataReady => &self.data_ready,
            Destination::ReductionStarted => &self.reduction_started,
            Destination::ReductionComplete => &self.reduction_complete,
            Destination::ReductionError => &self.reduction_error,
            Destination::ReductionSkipped => &self.reduction_skipped,
            Destination::ReductionPending => &self.reduction_pending,
        }
    }

    /// Destination for a tag, if the tag is known.
    pub fn resolve(&self, tag: &str) -> Option<Destination> {
        [
            Destination::DataReady,
            Destination::ReductionStarted,
            Destination::ReductionComplete,
            Destination::ReductionError,
            Destination::ReductionSkipped,
            Destination::ReductionPending,
        ]
        .into_iter()
        .find(|d| self.tag(*d) == tag)
    }

    /// Tags the lifecycle consumer subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        Destination::CONSUMED
            .iter()
            .map(|d| self.tag(*d).to_string())
            .collect()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in [
                "AUTOREDUCE_SCRIPTS_DIR",
                "AUTOREDUCE_POLL_INTERVAL_MS",
                "AUTOREDUCE_BATCH_SIZE",
                "AUTOREDUCE_MAX_RETRY_VERSION",
                "AUTOREDUCE_QUEUE_DATA_READY",
                "AUTOREDUCE_QUEUE_REDUCTION_STARTED",
                "AUTOREDUCE_QUEUE_REDUCTION_COMPLETE",
                "AUTOREDUCE_QUEUE_REDUCTION_ERROR",
                "AUTOREDUCE_QUEUE_REDUCTION_SKIPPED",
                "AUTOREDUCE_QUEUE_REDUCTION_PENDING",
            ] {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("AUTOREDUCE_DATABASE_URL", "postgres://localhost/autoreduce");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/autoreduce");
        assert_eq!(config.scripts_dir, DEFAULT_SCRIPTS_DIR);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retry_version, 4);
        assert_eq!(config.queues, QueueNames::default());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("AUTOREDUCE_DATABASE_URL", "sqlite:autoreduce.db");
        guard.clear_optional();
        guard.set("AUTOREDUCE_SCRIPTS_DIR", "/scripts/{instrument}");
        guard.set("AUTOREDUCE_POLL_INTERVAL_MS", "250");
        guard.set("AUTOREDUCE_BATCH_SIZE", "50");
        guard.set("AUTOREDUCE_MAX_RETRY_VERSION", "2");
        guard.set("AUTOREDUCE_QUEUE_DATA_READY", "/topic/ready");

        let config = Config::from_env().unwrap();

        assert_eq!(config.scripts_dir, "/scripts/{instrument}");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retry_version, 2);
        assert_eq!(config.queues.data_ready, "/topic/ready");
        assert_eq!(config.queues.reduction_error, "/queue/ReductionError");
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("AUTOREDUCE_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("AUTOREDUCE_DATABASE_URL")));
        assert!(err.to_string().contains("AUTOREDUCE_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("AUTOREDUCE_DATABASE_URL", "postgres://localhost/autoreduce");
        guard.clear_optional();

        guard.set("AUTOREDUCE_BATCH_SIZE", "abc");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("AUTOREDUCE_BATCH_SIZE", _)
        ));

        guard.set("AUTOREDUCE_BATCH_SIZE", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("AUTOREDUCE_BATCH_SIZE", _)
        ));
    }

    #[test]
    fn test_config_invalid_poll_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("AUTOREDUCE_DATABASE_URL", "postgres://localhost/autoreduce");
        guard.clear_optional();
        guard.set("AUTOREDUCE_POLL_INTERVAL_MS", "-5");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("AUTOREDUCE_POLL_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_queue_names_resolve_and_tag() {
        let queues = QueueNames::default();
        assert_eq!(
            queues.resolve("/queue/ReductionComplete"),
            Some(Destination::ReductionComplete)
        );
        assert_eq!(queues.resolve("unknown"), None);
        assert_eq!(
            queues.tag(Destination::ReductionPending),
            "/queue/ReductionPending"
        );
        let subs = queues.subscriptions();
        assert_eq!(subs.len(), 5);
        assert!(!subs.contains(&"/queue/ReductionPending".to_string()));
    }
}
