//! Engine configuration.
//!
//! Every knob has a default. [`EngineConfig::from_env`] overrides the defaults
//! from `TETHER_*` environment variables.

use crate::codec::CompressionPolicy;
use crate::conflict::{PredictorWeights, ResolutionStrategy, ScalarPolicy};
use crate::queue::{DEFAULT_CAPACITY, DEFAULT_HISTORY_LIMIT};
use crate::retry::BackoffStrategy;
use crate::{EntityType, Priority, DEFAULT_MAX_RETRIES};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Operation queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of live operations
    pub capacity: usize,
    /// Completed and failed operations kept for inspection
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Retry settings applied to operations that do not bring their own.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Seed for the jitter source; entropy when unset
    pub seed: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffStrategy::default(),
            seed: None,
        }
    }
}

/// Conflict predictor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    pub weights: PredictorWeights,
    /// Adjust probabilities from observed conflicts
    pub learning: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            weights: PredictorWeights::default(),
            learning: true,
        }
    }
}

/// Conflict resolver settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolverConfig {
    pub default_strategy: ResolutionStrategy,
    /// Per entity type overrides of `default_strategy`
    pub strategies: HashMap<EntityType, ResolutionStrategy>,
    pub default_scalar_policy: ScalarPolicy,
    /// Per entity type overrides of `default_scalar_policy`
    pub scalar_policies: HashMap<EntityType, ScalarPolicy>,
}

/// Consistency checker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyConfig {
    /// Clock difference between copies of the same version tolerated silently
    pub timestamp_drift_ms: u64,
    /// Records compared by checksum in a full check
    pub checksum_sample_size: usize,
    pub history_limit: usize,
    pub alert_limit: usize,
    /// Enqueue corrective operations for auto-fixable results
    pub auto_repair: bool,
    /// Seed for checksum sampling; entropy when unset
    pub seed: Option<u64>,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            timestamp_drift_ms: 60_000,
            checksum_sample_size: 20,
            history_limit: 200,
            alert_limit: 100,
            auto_repair: true,
            seed: None,
        }
    }
}

/// Transmission scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionConfig {
    /// Largest batch sent on an excellent connection
    pub max_batch_size: usize,
    /// Concurrent transmissions
    pub pool_size: usize,
    pub compression: CompressionPolicy,
    /// Remote call timeout for operations without their own
    pub default_timeout_ms: u64,
    /// Waiting this long raises a request by one priority rank
    pub aging_interval_ms: u64,
    /// EWMA smoothing factor for throughput and RTT samples, in (0, 1]
    pub bandwidth_smoothing: f64,
    /// Bandwidth assumed before the first sample
    pub initial_bandwidth_bps: u64,
    /// Fraction of the estimated bandwidth each priority class may use
    pub class_shares: BTreeMap<Priority, f64>,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        let class_shares = [
            (Priority::Critical, 1.0),
            (Priority::High, 0.4),
            (Priority::Normal, 0.3),
            (Priority::Low, 0.2),
            (Priority::Background, 0.1),
        ]
        .into_iter()
        .collect();

        Self {
            max_batch_size: 16,
            pool_size: 4,
            compression: CompressionPolicy::default(),
            default_timeout_ms: 30_000,
            aging_interval_ms: 30_000,
            bandwidth_smoothing: 0.3,
            initial_bandwidth_bps: 1_000_000,
            class_shares,
        }
    }
}

/// Background loop intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub sync_interval_ms: u64,
    pub quick_check_interval_ms: u64,
    pub full_check_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            quick_check_interval_ms: 60_000,
            full_check_interval_ms: 15 * 60_000,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub predictor: PredictorConfig,
    pub resolver: ResolverConfig,
    pub consistency: ConsistencyConfig,
    pub transmission: TransmissionConfig,
    pub sync: SyncConfig,
}

impl EngineConfig {
    /// Load configuration from `TETHER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "TETHER_QUEUE_CAPACITY")? {
            config.queue.capacity = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_RETRY_INITIAL_DELAY_MS")? {
            config.retry.backoff.initial_delay_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_RETRY_MAX_DELAY_MS")? {
            config.retry.backoff.max_delay_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_RETRY_JITTER")? {
            config.retry.backoff.jitter_factor = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_RISK_THRESHOLD")? {
            config.predictor.weights.risk_threshold = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_PREDICTION_WINDOW_MS")? {
            config.predictor.weights.window_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_DEFAULT_STRATEGY")? {
            config.resolver.default_strategy = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_MAX_BATCH_SIZE")? {
            config.transmission.max_batch_size = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_POOL_SIZE")? {
            config.transmission.pool_size = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_COMPRESSION_THRESHOLD")? {
            config.transmission.compression.threshold_bytes = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TETHER_COMPRESSION_BUDGET_MS")? {
            config.transmission.compression.budget = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "TETHER_OPERATION_TIMEOUT_MS")? {
            config.transmission.default_timeout_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_AGING_INTERVAL_MS")? {
            config.transmission.aging_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_TIMESTAMP_DRIFT_MS")? {
            config.consistency.timestamp_drift_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_CHECKSUM_SAMPLE_SIZE")? {
            config.consistency.checksum_sample_size = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_AUTO_REPAIR")? {
            config.consistency.auto_repair = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_SYNC_INTERVAL_MS")? {
            config.sync.sync_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_QUICK_CHECK_INTERVAL_MS")? {
            config.sync.quick_check_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "TETHER_FULL_CHECK_INTERVAL_MS")? {
            config.sync.full_check_interval_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_predictor(mut self, predictor: PredictorConfig) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_consistency(mut self, consistency: ConsistencyConfig) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_transmission(mut self, transmission: TransmissionConfig) -> Self {
        self.transmission = transmission;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue capacity must be positive".into()));
        }
        if self.transmission.max_batch_size == 0 || self.transmission.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size and pool size must be positive".into(),
            ));
        }
        if self.transmission.aging_interval_ms == 0 {
            return Err(ConfigError::Invalid("aging interval must be positive".into()));
        }
        let smoothing = self.transmission.bandwidth_smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(ConfigError::Invalid(
                "bandwidth smoothing must be in (0, 1]".into(),
            ));
        }
        let backoff = &self.retry.backoff;
        if backoff.initial_delay_ms > backoff.max_delay_ms {
            return Err(ConfigError::Invalid(
                "initial retry delay exceeds the maximum delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(ConfigError::Invalid("jitter factor must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.predictor.weights.risk_threshold) {
            return Err(ConfigError::Invalid("risk threshold must be in [0, 1]".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
