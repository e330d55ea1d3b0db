//! Engine configuration: cache sizing and statistics request parameters.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{Error, Result};

/// Configuration for one [`TtlCache`](crate::cache::TtlCache).
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long an entry stays valid after insertion.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(rename = "ttl_seconds")]
    pub ttl: Duration,
    /// Maximum number of entries. Once reached, the oldest-inserted entry is evicted.
    pub max_entries: usize,
}

impl CacheConfig {
    pub const fn new(ttl: Duration, max_entries: usize) -> CacheConfig {
        CacheConfig { ttl, max_entries }
    }

    /// Update time-to-live with `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> CacheConfig {
        self.ttl = ttl;
        self
    }

    /// Update maximum number of entries with `max_entries`.
    pub fn with_max_entries(mut self, max_entries: usize) -> CacheConfig {
        self.max_entries = max_entries;
        self
    }
}

/// Configuration for [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Experiment lookups (experiment with its variants).
    ///
    /// Defaults to [`EngineConfig::DEFAULT_EXPERIMENT_CACHE`].
    pub experiment_cache: CacheConfig,
    /// Segment lookups. Membership changes more often than experiments, so the TTL is shorter.
    ///
    /// Defaults to [`EngineConfig::DEFAULT_SEGMENT_CACHE`].
    pub segment_cache: CacheConfig,
    /// Variant assignments keyed by `(user, experiment)`.
    ///
    /// Defaults to [`EngineConfig::DEFAULT_ASSIGNMENT_CACHE`].
    pub assignment_cache: CacheConfig,
}

impl EngineConfig {
    /// Default value for [`EngineConfig::experiment_cache`]: 5 minutes, 1 000 entries.
    pub const DEFAULT_EXPERIMENT_CACHE: CacheConfig =
        CacheConfig::new(Duration::from_secs(5 * 60), 1_000);
    /// Default value for [`EngineConfig::segment_cache`]: 1 minute, 1 000 entries.
    pub const DEFAULT_SEGMENT_CACHE: CacheConfig = CacheConfig::new(Duration::from_secs(60), 1_000);
    /// Default value for [`EngineConfig::assignment_cache`]: 24 hours, 10 000 entries.
    pub const DEFAULT_ASSIGNMENT_CACHE: CacheConfig =
        CacheConfig::new(Duration::from_secs(24 * 60 * 60), 10_000);

    /// Create a new `EngineConfig` using default configuration.
    pub fn new() -> EngineConfig {
        EngineConfig::default()
    }

    pub fn with_experiment_cache(mut self, config: CacheConfig) -> EngineConfig {
        self.experiment_cache = config;
        self
    }

    pub fn with_segment_cache(mut self, config: CacheConfig) -> EngineConfig {
        self.segment_cache = config;
        self
    }

    pub fn with_assignment_cache(mut self, config: CacheConfig) -> EngineConfig {
        self.assignment_cache = config;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            experiment_cache: EngineConfig::DEFAULT_EXPERIMENT_CACHE,
            segment_cache: EngineConfig::DEFAULT_SEGMENT_CACHE,
            assignment_cache: EngineConfig::DEFAULT_ASSIGNMENT_CACHE,
        }
    }
}

/// Parameters of a statistics request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsRequest {
    /// Event type counted as a conversion.
    pub conversion_event_type: String,
    /// Confidence level for intervals, within `[0, 1]`.
    pub confidence_level: f64,
    /// P-value threshold for significance, within `[0, 1]`.
    pub significance_threshold: f64,
}

impl StatisticsRequest {
    pub const DEFAULT_CONVERSION_EVENT_TYPE: &'static str = "conversion";
    pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
    pub const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.05;

    pub fn new() -> StatisticsRequest {
        StatisticsRequest::default()
    }

    pub fn with_conversion_event_type(mut self, event_type: impl Into<String>) -> StatisticsRequest {
        self.conversion_event_type = event_type.into();
        self
    }

    pub fn with_confidence_level(mut self, confidence_level: f64) -> StatisticsRequest {
        self.confidence_level = confidence_level;
        self
    }

    pub fn with_significance_threshold(mut self, threshold: f64) -> StatisticsRequest {
        self.significance_threshold = threshold;
        self
    }

    /// Check that parameters are within their accepted ranges.
    pub fn validate(&self) -> Result<()> {
        if self.conversion_event_type.is_empty() {
            return Err(Error::InvalidInput(
                "conversion_event_type must not be empty".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_level) {
            return Err(Error::InvalidInput(format!(
                "confidence_level must be within [0, 1], got {}",
                self.confidence_level
            )));
        }
        if !(0.0..=1.0).contains(&self.significance_threshold) {
            return Err(Error::InvalidInput(format!(
                "significance_threshold must be within [0, 1], got {}",
                self.significance_threshold
            )));
        }
        Ok(())
    }
}

impl Default for StatisticsRequest {
    fn default() -> StatisticsRequest {
        StatisticsRequest {
            conversion_event_type: StatisticsRequest::DEFAULT_CONVERSION_EVENT_TYPE.to_owned(),
            confidence_level: StatisticsRequest::DEFAULT_CONFIDENCE_LEVEL,
            significance_threshold: StatisticsRequest::DEFAULT_SIGNIFICANCE_THRESHOLD,
        }
    }
}
