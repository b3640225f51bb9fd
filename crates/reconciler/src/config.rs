//! Controller configuration.
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. TOML file (`keel.toml`)
//! 3. Environment variables: `KEEL_*`
//! 4. CLI flags (applied by the binary)
//!
//! # Example Config
//!
//! ```toml
//! workers = 8
//! resync_interval = 30000
//!
//! [poll]
//! interval = 10000
//! stale_after_failures = 3
//!
//! [backoff]
//! base_delay = 1000
//! max_delay = 60000
//! jitter = 0.2
//! ```
//!
//! All durations are milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Size of the reconcile worker pool.
    pub workers: usize,
    /// Period of the tick that enqueues a `periodic` task for every resource.
    #[serde(with = "duration_ms")]
    pub resync_interval: Duration,
    /// Observed-state polling.
    pub poll: PollConfig,
    /// Retry policy for transient action failures.
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(30),
            poll: PollConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Polling configuration for the observed-state tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Default per-resource poll interval.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// How often the poller checks which resources are due.
    #[serde(with = "duration_ms")]
    pub tick: Duration,
    /// Consecutive failures before health becomes `Unknown`.
    pub stale_after_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            stale_after_failures: 3,
        }
    }
}

impl ControllerConfig {
    /// Set the worker pool size.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the periodic resync interval.
    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the polling configuration.
    #[must_use]
    pub const fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Load from an optional TOML file, then apply `KEEL_*` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, an override
    /// is malformed, or the result fails [`Self::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let raw = keel_core::format::read_file(path)?;
                keel_core::format::from_toml::<Self>(&raw)?
            }
            None => Self::default(),
        };

        let config = base.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEEL_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a value is not a number.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KEEL_WORKERS") {
            self.workers = parse_number("KEEL_WORKERS", &v)?;
        }
        if let Some(v) = lookup("KEEL_RESYNC_INTERVAL_MS") {
            self.resync_interval = Duration::from_millis(parse_number("KEEL_RESYNC_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("KEEL_POLL_INTERVAL_MS") {
            self.poll.interval = Duration::from_millis(parse_number("KEEL_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("KEEL_STALE_AFTER_FAILURES") {
            self.poll.stale_after_failures = parse_number("KEEL_STALE_AFTER_FAILURES", &v)?;
        }
        if let Some(v) = lookup("KEEL_MAX_ATTEMPTS") {
            self.backoff.max_attempts = Some(parse_number("KEEL_MAX_ATTEMPTS", &v)?);
        }
        Ok(self)
    }

    /// Reject configurations the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::invalid_config("resync_interval must be non-zero"));
        }
        if self.poll.interval.is_zero() || self.poll.tick.is_zero() {
            return Err(Error::invalid_config("poll interval and tick must be non-zero"));
        }
        if self.poll.stale_after_failures == 0 {
            return Err(Error::invalid_config("stale_after_failures must be at least 1"));
        }
        let backoff = &self.backoff;
        if backoff.base_delay.is_zero() {
            return Err(Error::invalid_config("backoff base_delay must be non-zero"));
        }
        if backoff.max_delay < backoff.base_delay {
            return Err(Error::invalid_config(
                "backoff max_delay must not be below base_delay",
            ));
        }
        if !(0.0..1.0).contains(&backoff.jitter) {
            return Err(Error::invalid_config("backoff jitter must be in [0, 1)"));
        }
        if backoff.multiplier < 1.0 {
            return Err(Error::invalid_config("backoff multiplier must be >= 1"));
        }
        if backoff.max_attempts == Some(0) {
            return Err(Error::invalid_config("backoff max_attempts must be at least 1"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("{key}: '{value}' is not a valid number")))
}

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an `Option<Duration>` as optional integer milliseconds.
pub mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
