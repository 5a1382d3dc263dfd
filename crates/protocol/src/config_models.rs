//! Global configuration models for `.repodoc/config.toml`.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! pause_timeout_minutes = 5
//! stage_timeout_seconds = 600
//! max_retries = 3
//!
//! [storage]
//! runs_dir = ".repodoc/runs"
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Represents global settings from `.repodoc/config.toml`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, TS)]
pub struct GlobalConfig {
    /// Orchestration engine tuning.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Where run records and event logs are persisted.
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Tunables for the orchestration engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct EngineSettings {
    /// Minutes a run may stay paused before it is cancelled.
    ///
    /// `0` disables the auto-cancel deadline.
    #[serde(default = "default_pause_timeout_minutes")]
    pub pause_timeout_minutes: u64,

    /// Hard limit for a single stage attempt.
    #[serde(default = "default_stage_timeout_seconds")]
    pub stage_timeout_seconds: u64,

    /// Retries allowed after the first attempt of a stage for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound for any single retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Growth factor applied to the delay after every retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Lifetime of a driver lease. An expired lease may be taken over.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// How often a driver renews its lease while a stage is in flight.
    ///
    /// Never less often than a third of `lease_ttl_seconds`.
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// How often paused runs and lagging subscribers re-check the store.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pause_timeout_minutes: default_pause_timeout_minutes(),
            stage_timeout_seconds: default_stage_timeout_seconds(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            lease_ttl_seconds: default_lease_ttl_seconds(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Storage location settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct StorageSettings {
    /// Directory (relative to the project root) holding run records.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
        }
    }
}

fn default_pause_timeout_minutes() -> u64 {
    5
}

fn default_stage_timeout_seconds() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_lease_ttl_seconds() -> u64 {
    3_600
}

fn default_lease_renew_interval_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_runs_dir() -> String {
    ".repodoc/runs".to_string()
}
