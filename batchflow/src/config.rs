//! Orchestrator configuration.
//!
//! One immutable [`OrchestratorConfig`] is built at start-up, validated, and
//! shared by every component as `Arc<OrchestratorConfig>`. All fields carry
//! serde defaults so partial documents deserialize cleanly.

use crate::errors::BatchflowError;
use crate::pool::PoolKind;
use crate::retry::{JitterStrategy, RetryPolicy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Pool capacities.
    #[serde(default)]
    pub pools: PoolConfig,
    /// Per-stage deadlines.
    #[serde(default)]
    pub timeouts: StageTimeouts,
    /// Batch partitioning.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Memory-pressure thresholds.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Retry budgets.
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Capacity of each resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrently active pipelines.
    #[serde(default = "default_pipeline_slots")]
    pub pipeline: usize,
    /// Concurrent split operations.
    #[serde(default = "default_split_slots")]
    pub split: usize,
    /// Concurrent uploads.
    #[serde(default = "default_upload_slots")]
    pub upload: usize,
    /// Concurrent remote evaluations.
    #[serde(default = "default_process_slots")]
    pub process: usize,
    /// Concurrent cleanup calls.
    #[serde(default = "default_cleanup_slots")]
    pub cleanup: usize,
}

/// Largest duration setting accepted, in seconds (30 days).
pub const MAX_DURATION_SECONDS: f64 = 30.0 * 24.0 * 3600.0;

/// Converts a seconds setting into a `Duration`, clamped to
/// `0..=MAX_DURATION_SECONDS`. Non-finite values become zero.
#[must_use]
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_DURATION_SECONDS)).unwrap_or(Duration::ZERO)
}

fn default_pipeline_slots() -> usize {
    10
}

fn default_split_slots() -> usize {
    2
}

fn default_upload_slots() -> usize {
    3
}

fn default_process_slots() -> usize {
    5
}

fn default_cleanup_slots() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline_slots(),
            split: default_split_slots(),
            upload: default_upload_slots(),
            process: default_process_slots(),
            cleanup: default_cleanup_slots(),
        }
    }
}

impl PoolConfig {
    /// Returns the capacity configured for a pool kind.
    #[must_use]
    pub fn capacity(&self, kind: PoolKind) -> usize {
        match kind {
            PoolKind::Pipeline => self.pipeline,
            PoolKind::Split => self.split,
            PoolKind::Upload => self.upload,
            PoolKind::Process => self.process,
            PoolKind::Cleanup => self.cleanup,
        }
    }
}

/// Stage deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Download plus split.
    #[serde(default = "default_split_timeout")]
    pub split_seconds: f64,
    /// Upload of one item's sections.
    #[serde(default = "default_upload_timeout")]
    pub upload_seconds: f64,
    /// One remote evaluation.
    #[serde(default = "default_process_timeout")]
    pub process_seconds: f64,
    /// One remote delete.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_seconds: f64,
    /// How long a stage may wait for a pool permit.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_seconds: f64,
}

fn default_split_timeout() -> f64 {
    120.0
}

fn default_upload_timeout() -> f64 {
    120.0
}

fn default_process_timeout() -> f64 {
    300.0
}

fn default_cleanup_timeout() -> f64 {
    60.0
}

fn default_acquire_timeout() -> f64 {
    600.0
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            split_seconds: default_split_timeout(),
            upload_seconds: default_upload_timeout(),
            process_seconds: default_process_timeout(),
            cleanup_seconds: default_cleanup_timeout(),
            acquire_seconds: default_acquire_timeout(),
        }
    }
}

impl StageTimeouts {
    /// Returns the deadline for a stage.
    #[must_use]
    pub fn for_stage(&self, stage: crate::core::StageKind) -> Duration {
        use crate::core::StageKind;
        let seconds = match stage {
            StageKind::Split => self.split_seconds,
            StageKind::Upload => self.upload_seconds,
            StageKind::Process => self.process_seconds,
            StageKind::Cleanup => self.cleanup_seconds,
        };
        self::seconds(seconds)
    }

    /// Returns the permit acquisition timeout.
    #[must_use]
    pub fn acquire(&self) -> Duration {
        seconds(self.acquire_seconds)
    }
}

/// Batch partitioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches, in seconds.
    #[serde(default = "default_inter_batch_delay")]
    pub inter_batch_delay_seconds: f64,
}

fn default_batch_size() -> usize {
    5
}

fn default_inter_batch_delay() -> f64 {
    2.0
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            inter_batch_delay_seconds: default_inter_batch_delay(),
        }
    }
}

impl BatchConfig {
    /// Gets the inter-batch delay as a Duration.
    #[must_use]
    pub fn inter_batch_delay(&self) -> Duration {
        seconds(self.inter_batch_delay_seconds)
    }
}

/// Memory-pressure thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Resident memory above which work is slowed, in MB.
    #[serde(default = "default_soft_mb")]
    pub soft_threshold_mb: u64,
    /// Resident memory above which work is slowed further, in MB.
    #[serde(default = "default_hard_mb")]
    pub hard_threshold_mb: u64,
    /// Delay applied between the soft and hard thresholds.
    #[serde(default = "default_soft_delay")]
    pub soft_delay_seconds: f64,
    /// Delay applied at or above the hard threshold.
    #[serde(default = "default_hard_delay")]
    pub hard_delay_seconds: f64,
}

fn default_soft_mb() -> u64 {
    768
}

fn default_hard_mb() -> u64 {
    1024
}

fn default_soft_delay() -> f64 {
    1.0
}

fn default_hard_delay() -> f64 {
    5.0
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            soft_threshold_mb: default_soft_mb(),
            hard_threshold_mb: default_hard_mb(),
            soft_delay_seconds: default_soft_delay(),
            hard_delay_seconds: default_hard_delay(),
        }
    }
}

/// Retry budgets for stages and dependency nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts for upstream failures and timeouts.
    #[serde(default = "default_max_api_retries")]
    pub max_api_retries: u32,
    /// First backoff delay, in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    /// Backoff ceiling, in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: f64,
    /// Whether backoff delays are jittered.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Wait after a rate-limit signal, in seconds.
    #[serde(default = "default_cooldown")]
    pub retry_cooldown_seconds: f64,
    /// Rate-limit retries allowed per stage or node.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Data-not-ready retries allowed per node.
    #[serde(default = "default_max_data_retries")]
    pub max_data_dependency_retries: u32,
    /// Wait before re-evaluating a node whose input was not ready, in seconds.
    #[serde(default = "default_data_retry_delay")]
    pub data_retry_delay_seconds: f64,
    /// Pause all dispatch while a rate-limit cooldown is active.
    #[serde(default = "default_global_pause")]
    pub global_rate_limit_pause: bool,
    /// Dependency nodes evaluated concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_api_retries() -> u32 {
    3
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_max_backoff() -> f64 {
    30.0
}

fn default_jitter() -> bool {
    true
}

fn default_cooldown() -> f64 {
    60.0
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_max_data_retries() -> u32 {
    5
}

fn default_data_retry_delay() -> f64 {
    1.0
}

fn default_global_pause() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    8
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_api_retries: default_max_api_retries(),
            backoff_base_seconds: default_backoff_base(),
            max_backoff_seconds: default_max_backoff(),
            jitter: default_jitter(),
            retry_cooldown_seconds: default_cooldown(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_data_dependency_retries: default_max_data_retries(),
            data_retry_delay_seconds: default_data_retry_delay(),
            global_rate_limit_pause: default_global_pause(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl RetrySettings {
    /// Gets the rate-limit cooldown as a Duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        seconds(self.retry_cooldown_seconds)
    }

    /// Gets the data retry delay as a Duration.
    #[must_use]
    pub fn data_retry_delay(&self) -> Duration {
        seconds(self.data_retry_delay_seconds)
    }

    /// Builds the executor retry policy for these settings.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_api_retries)
            .with_backoff_base(seconds(self.backoff_base_seconds))
            .with_max_backoff(seconds(self.max_backoff_seconds))
            .with_rate_limit(self.cooldown(), self.max_rate_limit_retries)
            .with_jitter(if self.jitter {
                JitterStrategy::Full
            } else {
                JitterStrategy::None
            })
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity of one pool.
    #[must_use]
    pub fn with_pool_capacity(mut self, kind: PoolKind, capacity: usize) -> Self {
        match kind {
            PoolKind::Pipeline => self.pools.pipeline = capacity,
            PoolKind::Split => self.pools.split = capacity,
            PoolKind::Upload => self.pools.upload = capacity,
            PoolKind::Process => self.pools.process = capacity,
            PoolKind::Cleanup => self.pools.cleanup = capacity,
        }
        self
    }

    /// Sets the stage deadlines.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the batch size and inter-batch delay.
    #[must_use]
    pub fn with_batching(mut self, batch_size: usize, delay: Duration) -> Self {
        self.batch.batch_size = batch_size;
        self.batch.inter_batch_delay_seconds = delay.as_secs_f64();
        self
    }

    /// Sets the memory thresholds.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Sets the retry budgets.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), BatchflowError> {
        for kind in PoolKind::ALL {
            if self.pools.capacity(kind) == 0 {
                return Err(BatchflowError::Config(format!(
                    "pool '{kind}' must have capacity of at least 1"
                )));
            }
        }
        if self.batch.batch_size == 0 {
            return Err(BatchflowError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.memory.soft_threshold_mb > self.memory.hard_threshold_mb {
            return Err(BatchflowError::Config(format!(
                "memory soft threshold ({} MB) exceeds hard threshold ({} MB)",
                self.memory.soft_threshold_mb, self.memory.hard_threshold_mb
            )));
        }
        if self.retry.max_api_retries == 0 {
            return Err(BatchflowError::Config(
                "max_api_retries must be at least 1".to_string(),
            ));
        }
        if self.retry.max_in_flight == 0 {
            return Err(BatchflowError::Config(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        let durations = [
            ("timeouts.split_seconds", self.timeouts.split_seconds),
            ("timeouts.upload_seconds", self.timeouts.upload_seconds),
            ("timeouts.process_seconds", self.timeouts.process_seconds),
            ("timeouts.cleanup_seconds", self.timeouts.cleanup_seconds),
            ("timeouts.acquire_seconds", self.timeouts.acquire_seconds),
            ("batch.inter_batch_delay_seconds", self.batch.inter_batch_delay_seconds),
            ("memory.soft_delay_seconds", self.memory.soft_delay_seconds),
            ("memory.hard_delay_seconds", self.memory.hard_delay_seconds),
            ("retry.backoff_base_seconds", self.retry.backoff_base_seconds),
            ("retry.max_backoff_seconds", self.retry.max_backoff_seconds),
            ("retry.retry_cooldown_seconds", self.retry.retry_cooldown_seconds),
            ("retry.data_retry_delay_seconds", self.retry.data_retry_delay_seconds),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(BatchflowError::Config(format!(
                    "{name} must be a non-negative number of seconds, got {value}"
                )));
            }
            if value > MAX_DURATION_SECONDS {
                return Err(BatchflowError::Config(format!(
                    "{name} must be at most {MAX_DURATION_SECONDS} seconds, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Loads defaults overridden by `BATCHFLOW_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads defaults overridden by values from `lookup`, keyed by the
    /// `BATCHFLOW_*` variable names.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        override_from(&lookup, "BATCHFLOW_PIPELINE_SLOTS", &mut config.pools.pipeline)?;
        override_from(&lookup, "BATCHFLOW_SPLIT_SLOTS", &mut config.pools.split)?;
        override_from(&lookup, "BATCHFLOW_UPLOAD_SLOTS", &mut config.pools.upload)?;
        override_from(&lookup, "BATCHFLOW_PROCESS_SLOTS", &mut config.pools.process)?;
        override_from(&lookup, "BATCHFLOW_CLEANUP_SLOTS", &mut config.pools.cleanup)?;

        override_from(&lookup, "BATCHFLOW_SPLIT_TIMEOUT_SECONDS", &mut config.timeouts.split_seconds)?;
        override_from(&lookup, "BATCHFLOW_UPLOAD_TIMEOUT_SECONDS", &mut config.timeouts.upload_seconds)?;
        override_from(&lookup, "BATCHFLOW_PROCESS_TIMEOUT_SECONDS", &mut config.timeouts.process_seconds)?;
        override_from(&lookup, "BATCHFLOW_CLEANUP_TIMEOUT_SECONDS", &mut config.timeouts.cleanup_seconds)?;
        override_from(&lookup, "BATCHFLOW_ACQUIRE_TIMEOUT_SECONDS", &mut config.timeouts.acquire_seconds)?;

        override_from(&lookup, "BATCHFLOW_BATCH_SIZE", &mut config.batch.batch_size)?;
        override_from(
            &lookup,
            "BATCHFLOW_INTER_BATCH_DELAY_SECONDS",
            &mut config.batch.inter_batch_delay_seconds,
        )?;

        override_from(&lookup, "BATCHFLOW_MEMORY_SOFT_MB", &mut config.memory.soft_threshold_mb)?;
        override_from(&lookup, "BATCHFLOW_MEMORY_HARD_MB", &mut config.memory.hard_threshold_mb)?;

        override_from(&lookup, "BATCHFLOW_MAX_API_RETRIES", &mut config.retry.max_api_retries)?;
        override_from(
            &lookup,
            "BATCHFLOW_MAX_DATA_DEPENDENCY_RETRIES",
            &mut config.retry.max_data_dependency_retries,
        )?;
        override_from(
            &lookup,
            "BATCHFLOW_MAX_RATE_LIMIT_RETRIES",
            &mut config.retry.max_rate_limit_retries,
        )?;
        override_from(
            &lookup,
            "BATCHFLOW_RETRY_COOLDOWN_SECONDS",
            &mut config.retry.retry_cooldown_seconds,
        )?;
        override_from(
            &lookup,
            "BATCHFLOW_GLOBAL_RATE_LIMIT_PAUSE",
            &mut config.retry.global_rate_limit_pause,
        )?;
        override_from(&lookup, "BATCHFLOW_MAX_IN_FLIGHT", &mut config.retry.max_in_flight)?;

        config.validate()?;
        Ok(config)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, target: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.retry.max_api_retries, 3);
        assert_eq!(config.retry.max_data_dependency_retries, 5);
        assert_eq!(config.retry.cooldown(), Duration::from_secs(60));
        assert_eq!(config.memory.soft_threshold_mb, 768);
        assert_eq!(config.memory.hard_threshold_mb, 1024);
        assert_eq!(config.timeouts.for_stage(StageKind::Process), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"pools": {"upload": 1}, "batch": {"batch_size": 12}}"#)
                .unwrap();
        assert_eq!(config.pools.upload, 1);
        assert_eq!(config.pools.split, 2);
        assert_eq!(config.batch.batch_size, 12);
        assert_eq!(config.batch.inter_batch_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = OrchestratorConfig::new().with_pool_capacity(PoolKind::Split, 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("split"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = OrchestratorConfig::new().with_memory(MemoryConfig {
            soft_threshold_mb: 2048,
            ..MemoryConfig::default()
        });
        assert!(matches!(config.validate(), Err(BatchflowError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_durations() {
        let mut config = OrchestratorConfig::new();
        config.timeouts.upload_seconds = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = OrchestratorConfig::new();
        config.retry.retry_cooldown_seconds = 1e20;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.retry_cooldown_seconds"));

        assert_eq!(config.retry.cooldown(), Duration::from_secs_f64(MAX_DURATION_SECONDS));
    }

    #[test]
    fn test_from_lookup_rejects_oversized_cooldown() {
        let err = OrchestratorConfig::from_lookup(|name| {
            (name == "BATCHFLOW_RETRY_COOLDOWN_SECONDS").then(|| "1e20".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("retry_cooldown_seconds"), "{err}");
    }

    #[test]
    fn test_seconds_clamps_out_of_range_values() {
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(-3.0), Duration::ZERO);
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
        assert_eq!(seconds(f64::INFINITY), Duration::from_secs_f64(MAX_DURATION_SECONDS));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BATCHFLOW_MAX_API_RETRIES", "4"),
            ("BATCHFLOW_RETRY_COOLDOWN_SECONDS", "15"),
            ("BATCHFLOW_BATCH_SIZE", " 7 "),
            ("BATCHFLOW_GLOBAL_RATE_LIMIT_PAUSE", "false"),
        ]
        .into_iter()
        .collect();

        let config =
            OrchestratorConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string()))
                .unwrap();

        assert_eq!(config.retry.max_api_retries, 4);
        assert_eq!(config.retry.cooldown(), Duration::from_secs(15));
        assert_eq!(config.batch.batch_size, 7);
        assert!(!config.retry.global_rate_limit_pause);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = OrchestratorConfig::from_lookup(|name| {
            (name == "BATCHFLOW_MAX_DATA_DEPENDENCY_RETRIES").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("BATCHFLOW_MAX_DATA_DEPENDENCY_RETRIES"));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let policy = RetrySettings::default().policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.rate_limit_cooldown, Duration::from_secs(60));
        assert_eq!(policy.rate_limit_max_attempts, 3);
    }
}
