//! Executor configuration.
//!
//! Loaded from an optional TOML file with `PHASERUNNER_`-prefixed
//! environment overrides, or built programmatically with the `with_*`
//! setters. Every field has a working default so a bare `ExecutorConfig`
//! is usable in tests.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Parallel-scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    /// Whether parallel execution is enabled.
    pub enabled: bool,
    /// Maximum phases per parallel group.
    pub max_parallel_phases: usize,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_phases: 3,
        }
    }
}

/// Lease settings for exclusive maintenance operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Time-to-live of a held lease, in seconds.
    pub ttl_seconds: u64,
    /// Renewal buffer before waiters may break the lock, in seconds.
    pub grace_period_seconds: u64,
    /// Sleep between acquisition polls, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            grace_period_seconds: 30,
            poll_interval_ms: 250,
        }
    }
}

impl LeaseSettings {
    /// TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Grace period as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Top-level executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Datastore URL, e.g. `sqlite://.phaserunner/phases.db`.
    pub database_url: String,
    /// Run this executor instance operates on.
    pub run_id: String,
    /// Parallel-scheduling settings.
    pub parallel: ParallelSettings,
    /// Lease settings.
    pub lease: LeaseSettings,
    /// Attempt budget for the last-resort force-mark path.
    pub force_mark_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://.phaserunner/phases.db".to_string(),
            run_id: "default".to_string(),
            parallel: ParallelSettings::default(),
            lease: LeaseSettings::default(),
            force_mark_retries: 3,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from an optional TOML file, then apply
    /// `PHASERUNNER_`-prefixed environment overrides (nested keys joined
    /// with `__`, e.g. `PHASERUNNER_PARALLEL__MAX_PARALLEL_PHASES=5`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("PHASERUNNER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Missing keys fall back to the defaults via serde(default).
        Ok(settings.try_deserialize()?)
    }

    /// Set the datastore URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the run identifier.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Enable or disable parallel execution.
    pub fn with_parallel_enabled(mut self, enabled: bool) -> Self {
        self.parallel.enabled = enabled;
        self
    }

    /// Set the maximum parallel group size.
    pub fn with_max_parallel_phases(mut self, max: usize) -> Self {
        self.parallel.max_parallel_phases = max;
        self
    }

    /// Set the force-mark attempt budget.
    pub fn with_force_mark_retries(mut self, retries: u32) -> Self {
        self.force_mark_retries = retries;
        self
    }
}
