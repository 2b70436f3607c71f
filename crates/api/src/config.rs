//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use inventory::{ReconcilerSettings, ReservationPolicy};
use saga::{RetryConfig, SagaSettings};
use sync::RelaySettings;

/// Server and engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` (default `0.0.0.0`), `PORT` (default `3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset selects the in-memory store
/// - `RESERVATION_TTL_SECS` (1800)
/// - `RECONCILE_INTERVAL_SECS` (300), `RECONCILE_BATCH_SIZE` (500)
/// - `RELEASE_RETRY_INTERVAL_SECS` (30): how often deferred order releases are retried
/// - `SAGA_WORKERS` (16), `SAGA_STEP_TIMEOUT_MS` (5000), `SAGA_STEP_MAX_ATTEMPTS` (3)
/// - `OUTBOX_POLL_INTERVAL_MS` (500), `OUTBOX_MAX_ATTEMPTS` (10)
/// - `OUTBOX_RETENTION_SECS` (86400): age after which finished outbox rows are purged
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub reservation_ttl_secs: i64,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch_size: usize,
    pub release_retry_interval_secs: u64,
    pub saga_workers: usize,
    pub saga_step_timeout_ms: u64,
    pub saga_step_max_attempts: u32,
    pub outbox_poll_interval_ms: u64,
    pub outbox_max_attempts: u32,
    pub outbox_retention_secs: i64,
    /// Values that could not be parsed; see [`Config::log_ignored`].
    pub ignored: Vec<IgnoredValue>,
}

/// An environment value that failed to parse and was replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredValue {
    pub key: String,
    pub value: String,
}

/// Reads typed values, remembering the ones it had to ignore.
///
/// Configuration is read before tracing is installed, so problems are kept
/// here and logged by [`Config::log_ignored`] once it is.
struct EnvReader<F> {
    lookup: F,
    ignored: Vec<IgnoredValue>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            ignored: Vec::new(),
        }
    }

    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn or<T: FromStr>(&mut self, key: &str, default: T) -> T {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        raw.parse().unwrap_or_else(|_| {
            self.ignored.push(IgnoredValue {
                key: key.to_string(),
                value: raw,
            });
            default
        })
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut env = EnvReader::new(lookup);
        let mut config = Self {
            host: env.raw("HOST").unwrap_or(defaults.host),
            port: env.or("PORT", defaults.port),
            log_level: env.raw("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: env.raw("DATABASE_URL").filter(|url| !url.is_empty()),
            reservation_ttl_secs: env.or("RESERVATION_TTL_SECS", defaults.reservation_ttl_secs),
            reconcile_interval_secs: env.or(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            reconcile_batch_size: env.or("RECONCILE_BATCH_SIZE", defaults.reconcile_batch_size),
            release_retry_interval_secs: env.or(
                "RELEASE_RETRY_INTERVAL_SECS",
                defaults.release_retry_interval_secs,
            ),
            saga_workers: env.or("SAGA_WORKERS", defaults.saga_workers),
            saga_step_timeout_ms: env.or("SAGA_STEP_TIMEOUT_MS", defaults.saga_step_timeout_ms),
            saga_step_max_attempts: env.or(
                "SAGA_STEP_MAX_ATTEMPTS",
                defaults.saga_step_max_attempts,
            ),
            outbox_poll_interval_ms: env.or(
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.outbox_poll_interval_ms,
            ),
            outbox_max_attempts: env.or("OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts),
            outbox_retention_secs: env.or("OUTBOX_RETENTION_SECS", defaults.outbox_retention_secs),
            ignored: Vec::new(),
        };
        config.ignored = env.ignored;
        config
    }

    /// Warns about every value `from_env` replaced with its default.
    pub fn log_ignored(&self) {
        for ignored in &self.ignored {
            tracing::warn!(
                key = %ignored.key,
                value = %ignored.value,
                "ignoring unparsable configuration value"
            );
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reservation_policy(&self) -> ReservationPolicy {
        chrono::Duration::try_seconds(self.reservation_ttl_secs.max(1))
            .map(|default_ttl| ReservationPolicy { default_ttl })
            .unwrap_or_default()
    }

    pub fn release_retry_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.release_retry_interval_secs.max(1))
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: StdDuration::from_secs(self.reconcile_interval_secs.max(1)),
            batch_size: self.reconcile_batch_size.max(1),
            ..ReconcilerSettings::default()
        }
    }

    pub fn saga_settings(&self) -> SagaSettings {
        SagaSettings {
            retry: RetryConfig {
                max_attempts: self.saga_step_max_attempts.max(1),
                step_timeout: StdDuration::from_millis(self.saga_step_timeout_ms),
                ..RetryConfig::default()
            },
            ..SagaSettings::default()
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            worker_id: format!("relay-{}", std::process::id()),
            poll_interval: StdDuration::from_millis(self.outbox_poll_interval_ms.max(1)),
            max_attempts: self.outbox_max_attempts.max(1),
            retention: chrono::Duration::try_seconds(self.outbox_retention_secs.max(1))
                .unwrap_or(RelaySettings::default().retention),
            ..RelaySettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            reservation_ttl_secs: 1800,
            reconcile_interval_secs: 300,
            reconcile_batch_size: 500,
            release_retry_interval_secs: 30,
            saga_workers: 16,
            saga_step_timeout_ms: 5000,
            saga_step_max_attempts: 3,
            outbox_poll_interval_ms: 500,
            outbox_max_attempts: 10,
            outbox_retention_secs: 86_400,
            ignored: Vec::new(),
        }
    }
}
