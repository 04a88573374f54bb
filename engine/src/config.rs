//! Configuration for the sync engine.

use crate::{error::SyncResult, DeviceId, EntityType, ResolutionStrategy, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Observed network quality, used to scale batch sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkQuality {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
}

impl FromStr for NetworkQuality {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excellent" => Ok(NetworkQuality::Excellent),
            "good" => Ok(NetworkQuality::Good),
            "fair" => Ok(NetworkQuality::Fair),
            "poor" => Ok(NetworkQuality::Poor),
            other => Err(SyncError::InvalidConfiguration(format!(
                "unknown network quality: {other}"
            ))),
        }
    }
}

/// Batch size for `entity_type` under `quality`.
///
/// Excellent doubles the base size, Fair halves it (never below 1) and Poor
/// sends one operation at a time.
pub fn adaptive_batch_size(entity_type: EntityType, quality: NetworkQuality) -> usize {
    let base = entity_type.handler().base_batch_size;
    match quality {
        NetworkQuality::Excellent => base * 2,
        NetworkQuality::Good => base,
        NetworkQuality::Fair => (base / 2).max(1),
        NetworkQuality::Poor => 1,
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Device ID stamped on local changes.
    pub device_id: DeviceId,
    /// Maximum operations in flight at once.
    pub concurrency_limit: usize,
    /// Deadline for a single remote call.
    pub timeout: Duration,
    /// Retry budget given to new operations.
    pub max_retries: u32,
    /// Backoff between retries.
    pub retry: RetryConfig,
    /// Network quality at startup.
    pub network_quality: NetworkQuality,
    /// Per-type strategy replacing the dispatch table default.
    pub strategy_overrides: BTreeMap<EntityType, ResolutionStrategy>,
    /// Scores for `DevicePriority`.
    pub device_priorities: BTreeMap<DeviceId, i32>,
    /// Fixed page size for pulls; adaptive when unset.
    pub pull_page_limit: Option<usize>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            concurrency_limit: 10,
            timeout: Duration::from_secs(30),
            max_retries: crate::DEFAULT_MAX_RETRIES,
            retry: RetryConfig::default(),
            network_quality: NetworkQuality::default(),
            strategy_overrides: BTreeMap::new(),
            device_priorities: BTreeMap::new(),
            pull_page_limit: None,
        }
    }

    /// Sets the concurrency limit.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry budget for new operations.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the initial network quality.
    pub fn with_network_quality(mut self, quality: NetworkQuality) -> Self {
        self.network_quality = quality;
        self
    }

    /// Overrides the resolution strategy for one type.
    pub fn with_strategy(mut self, entity_type: EntityType, strategy: ResolutionStrategy) -> Self {
        self.strategy_overrides.insert(entity_type, strategy);
        self
    }

    /// Sets the score of one device.
    pub fn with_device_priority(mut self, device: impl Into<DeviceId>, score: i32) -> Self {
        self.device_priorities.insert(device.into(), score);
        self
    }

    /// Sets a fixed pull page size.
    pub fn with_pull_page_limit(mut self, limit: usize) -> Self {
        self.pull_page_limit = Some(limit);
        self
    }

    /// Strategy for `entity_type`, honoring overrides.
    pub fn strategy_for(&self, entity_type: EntityType) -> ResolutionStrategy {
        self.strategy_overrides
            .get(&entity_type)
            .copied()
            .unwrap_or(entity_type.handler().default_strategy)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(SyncError::InvalidConfiguration("device id must not be empty".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(SyncError::InvalidConfiguration(
                "concurrency limit must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(SyncError::InvalidConfiguration("timeout must be positive".into()));
        }
        if self.pull_page_limit == Some(0) {
            return Err(SyncError::InvalidConfiguration(
                "pull page limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

/// Configuration for retry backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Retries without waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before retry number `attempt` (0 = first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}
