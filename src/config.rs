//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
///
/// Every field carries a default, so a pristine environment yields a fully
/// usable config. Per-consumer settings are derived from these values via
/// [`crate::models::Consumer::new`].
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The maximum number of messages per batch emitted downstream.
    #[serde(default = "Config::default_batch_size")]
    pub batch_size: u32,
    /// Seconds between periodic polls of the message store.
    ///
    /// The periodic poll exists so that newly-available messages are noticed
    /// even when no explicit demand signal or wakeup notification arrives.
    #[serde(default = "Config::default_batch_timeout_seconds")]
    pub batch_timeout_seconds: u64,
    /// Seconds between idempotency ledger trim passes.
    #[serde(default = "Config::default_trim_interval_seconds")]
    pub trim_interval_seconds: u64,
    /// The base redelivery backoff delay in milliseconds.
    #[serde(default = "Config::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// The ceiling on the redelivery backoff delay in milliseconds.
    #[serde(default = "Config::default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// The maximum number of deferrals included in a single store nack call.
    #[serde(default = "Config::default_nack_chunk_size")]
    pub nack_chunk_size: usize,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_batch_size() -> u32 {
        10
    }

    fn default_batch_timeout_seconds() -> u64 {
        10
    }

    fn default_trim_interval_seconds() -> u64 {
        30
    }

    fn default_backoff_base_ms() -> u64 {
        1_000
    }

    fn default_backoff_max_ms() -> u64 {
        180_000
    }

    fn default_nack_chunk_size() -> usize {
        1_000
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            batch_timeout_seconds: Self::default_batch_timeout_seconds(),
            trim_interval_seconds: Self::default_trim_interval_seconds(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_max_ms: Self::default_backoff_max_ms(),
            nack_chunk_size: Self::default_nack_chunk_size(),
        }
    }
}
