//! Engine configuration types for Flowline.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls worker
//! concurrency, queue polling, stall recovery, and the default step retry
//! policy.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for a Flowline worker process.
///
/// Loaded from `~/.flowline/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum workflow jobs processed concurrently.
    #[serde(default = "default_workflow_concurrency")]
    pub workflow_concurrency: usize,

    /// Maximum step jobs processed concurrently.
    #[serde(default = "default_step_concurrency")]
    pub step_concurrency: usize,

    /// Delay between polls when a queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reserved jobs older than this are considered stalled and requeued.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Times a job may be found stalled and put back before it is failed.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Retry policy for steps that do not declare their own.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[serde(default)]
    pub enable_otel: bool,
}

fn default_workflow_concurrency() -> usize {
    10
}

fn default_step_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stall_timeout_secs() -> u64 {
    300
}

fn default_max_stalled_count() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_concurrency: default_workflow_concurrency(),
            step_concurrency: default_step_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_stalled_count: default_max_stalled_count(),
            default_retry: RetryPolicy::default(),
            enable_otel: false,
        }
    }
}
