//! Configuration for the cache system

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "OUROBOROS_CACHE_";

/// Configuration for the tiered cache, eviction, and pattern learner.
///
/// Thresholds and frequencies are empirical; every one of them is exposed here
/// rather than baked into the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Minimum Jaccard score for a similarity hit (inclusive)
    pub similarity_threshold: f64,

    /// Candidates considered per similarity search, per tier
    pub candidate_limit: usize,

    /// Stores below this confidence are rejected
    pub min_confidence: f64,

    /// Longest accepted raw query, in characters
    pub max_query_chars: usize,

    /// Largest accepted payload, in bytes
    pub max_payload_bytes: usize,

    /// Byte budget of the memory tier
    pub memory_budget_bytes: usize,

    /// Occupancy fraction above which the sweep releases pressure
    pub pressure_threshold: f64,

    /// Occupancy fraction the pressure release evicts down to
    pub pressure_target: f64,

    /// Default lifetime per tier when an entry carries no explicit TTL
    pub memory_ttl: Duration,
    pub shared_ttl: Duration,
    pub persistent_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0), spreads expiry of entries stored together
    pub ttl_jitter: f64,

    /// Per-tier call timeouts
    pub shared_timeout: Duration,
    pub persistent_timeout: Duration,

    /// Aggregate deadline for `lookup()` / `store()`
    pub lookup_timeout: Duration,

    /// Interval of the background TTL sweep
    pub sweep_interval: Duration,

    /// Whether `start()` spawns the sweep task
    pub enable_background_sweep: bool,

    /// Low-quality purge: single-use entries older than this ...
    pub stale_entry_age: Duration,

    /// ... and with confidence below this are removed by the sweep
    pub stale_confidence: f64,

    /// Cluster frequency required for promotion
    pub promotion_frequency: u64,

    /// Mean cluster confidence required for promotion
    pub promotion_confidence: f64,

    /// Minimum payload token overlap with the cluster template; below it the
    /// new payload contradicts the cluster
    pub payload_agreement: f64,

    /// Unclustered observations retained per (tenant, category)
    pub observation_window: usize,

    /// Maximum number of knowledge entries
    pub knowledge_capacity: usize,

    /// Minimum knowledge match score
    pub knowledge_match_threshold: f64,

    /// Bound on concurrently running promotion/refresh tasks
    pub max_background_tasks: usize,

    /// Backend price used for savings estimates
    pub cost_per_1k_tokens: f64,

    /// Tokens dropped by the normalizer
    pub stop_words: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            candidate_limit: 50,
            min_confidence: 0.7,
            max_query_chars: 4096,
            max_payload_bytes: 1024 * 1024,
            // 64 MB
            memory_budget_bytes: 64 * 1024 * 1024,
            pressure_threshold: 0.8,
            pressure_target: 0.8,
            memory_ttl: Duration::from_secs(3600),
            shared_ttl: Duration::from_secs(6 * 3600),
            // 30 days
            persistent_ttl: Duration::from_secs(30 * 24 * 3600),
            ttl_jitter: 0.1,
            shared_timeout: Duration::from_millis(50),
            persistent_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            enable_background_sweep: true,
            stale_entry_age: Duration::from_secs(7 * 24 * 3600),
            stale_confidence: 0.8,
            promotion_frequency: 3,
            promotion_confidence: 0.85,
            payload_agreement: 0.3,
            observation_window: 256,
            knowledge_capacity: 256,
            knowledge_match_threshold: 0.7,
            max_background_tasks: 64,
            cost_per_1k_tokens: 0.002,
            stop_words: default_stop_words(),
        }
    }
}

/// English and Arabic function words
pub fn default_stop_words() -> Vec<String> {
    [
        "a", "an", "the", "is", "are", "was", "were", "be", "to", "of", "in", "on", "for",
        "with", "at", "by", "from", "and", "or", "do", "does", "how", "what", "i", "my", "me",
        "في", "من", "إلى", "الى", "على", "عن", "مع", "هذا", "هذه", "ذلك", "تلك", "التي",
        "الذي", "هل", "ما", "كيف", "أين", "متى", "لماذا", "هو", "هي", "أن", "إن", "كان",
        "كانت", "يكون", "تكون", "لا", "لم", "لن",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Defaults overridden by `OUROBOROS_CACHE_*` environment variables,
    /// after loading a `.env` file if one is present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Some(v) = env_parse::<f64>("SIMILARITY_THRESHOLD")? {
            config.similarity_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("CANDIDATE_LIMIT")? {
            config.candidate_limit = v;
        }
        if let Some(v) = env_parse::<f64>("MIN_CONFIDENCE")? {
            config.min_confidence = v;
        }
        if let Some(v) = env_parse::<usize>("MEMORY_BUDGET_BYTES")? {
            config.memory_budget_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("SHARED_TIMEOUT_MS")? {
            config.shared_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("PERSISTENT_TIMEOUT_MS")? {
            config.persistent_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("LOOKUP_TIMEOUT_MS")? {
            config.lookup_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("PROMOTION_FREQUENCY")? {
            config.promotion_frequency = v;
        }
        if let Some(v) = env_parse::<f64>("PROMOTION_CONFIDENCE")? {
            config.promotion_confidence = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(CacheError::ConfigError(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
            Ok(())
        };

        unit("similarity_threshold", self.similarity_threshold)?;
        unit("min_confidence", self.min_confidence)?;
        unit("pressure_threshold", self.pressure_threshold)?;
        unit("pressure_target", self.pressure_target)?;
        unit("ttl_jitter", self.ttl_jitter)?;
        unit("stale_confidence", self.stale_confidence)?;
        unit("promotion_confidence", self.promotion_confidence)?;
        unit("payload_agreement", self.payload_agreement)?;
        unit("knowledge_match_threshold", self.knowledge_match_threshold)?;

        if self.memory_budget_bytes == 0 {
            return Err(CacheError::ConfigError(
                "memory_budget_bytes must be greater than 0".to_string(),
            ));
        }

        if self.pressure_target > self.pressure_threshold {
            return Err(CacheError::ConfigError(
                "pressure_target must not exceed pressure_threshold".to_string(),
            ));
        }

        if self.candidate_limit == 0 {
            return Err(CacheError::ConfigError(
                "candidate_limit must be greater than 0".to_string(),
            ));
        }

        if self.promotion_frequency < 2 {
            return Err(CacheError::ConfigError(
                "promotion_frequency must be at least 2".to_string(),
            ));
        }

        if self.max_background_tasks == 0 {
            return Err(CacheError::ConfigError(
                "max_background_tasks must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "sweep_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply jitter to a tier lifetime
    pub fn with_jitter(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter == 0.0 {
            return ttl;
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    let key = format!("{}{}", ENV_PREFIX, name);
    match std::env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CacheError::ConfigError(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    similarity_threshold: Option<f64>,
    candidate_limit: Option<usize>,
    min_confidence: Option<f64>,
    max_query_chars: Option<usize>,
    memory_budget_bytes: Option<usize>,
    pressure_threshold: Option<f64>,
    pressure_target: Option<f64>,
    memory_ttl: Option<Duration>,
    shared_ttl: Option<Duration>,
    persistent_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    shared_timeout: Option<Duration>,
    persistent_timeout: Option<Duration>,
    lookup_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    enable_background_sweep: Option<bool>,
    promotion_frequency: Option<u64>,
    promotion_confidence: Option<f64>,
    payload_agreement: Option<f64>,
    knowledge_capacity: Option<usize>,
    knowledge_match_threshold: Option<f64>,
    stop_words: Option<Vec<String>>,
}

impl CacheConfigBuilder {
    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = Some(limit);
        self
    }

    pub fn min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn max_query_chars(mut self, chars: usize) -> Self {
        self.max_query_chars = Some(chars);
        self
    }

    /// Set memory tier byte budget
    pub fn memory_budget_bytes(mut self, size: usize) -> Self {
        self.memory_budget_bytes = Some(size);
        self
    }

    pub fn pressure_threshold(mut self, fraction: f64) -> Self {
        self.pressure_threshold = Some(fraction);
        self
    }

    pub fn pressure_target(mut self, fraction: f64) -> Self {
        self.pressure_target = Some(fraction);
        self
    }

    pub fn memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = Some(ttl);
        self
    }

    pub fn shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = Some(ttl);
        self
    }

    pub fn persistent_ttl(mut self, ttl: Duration) -> Self {
        self.persistent_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    pub fn shared_timeout(mut self, timeout: Duration) -> Self {
        self.shared_timeout = Some(timeout);
        self
    }

    pub fn persistent_timeout(mut self, timeout: Duration) -> Self {
        self.persistent_timeout = Some(timeout);
        self
    }

    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn enable_background_sweep(mut self, enable: bool) -> Self {
        self.enable_background_sweep = Some(enable);
        self
    }

    pub fn promotion_frequency(mut self, frequency: u64) -> Self {
        self.promotion_frequency = Some(frequency);
        self
    }

    pub fn promotion_confidence(mut self, confidence: f64) -> Self {
        self.promotion_confidence = Some(confidence);
        self
    }

    pub fn payload_agreement(mut self, agreement: f64) -> Self {
        self.payload_agreement = Some(agreement);
        self
    }

    pub fn knowledge_capacity(mut self, capacity: usize) -> Self {
        self.knowledge_capacity = Some(capacity);
        self
    }

    pub fn knowledge_match_threshold(mut self, threshold: f64) -> Self {
        self.knowledge_match_threshold = Some(threshold);
        self
    }

    pub fn stop_words(mut self, words: Vec<String>) -> Self {
        self.stop_words = Some(words);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            similarity_threshold: self
                .similarity_threshold
                .unwrap_or(defaults.similarity_threshold),
            candidate_limit: self.candidate_limit.unwrap_or(defaults.candidate_limit),
            min_confidence: self.min_confidence.unwrap_or(defaults.min_confidence),
            max_query_chars: self.max_query_chars.unwrap_or(defaults.max_query_chars),
            memory_budget_bytes: self
                .memory_budget_bytes
                .unwrap_or(defaults.memory_budget_bytes),
            pressure_threshold: self
                .pressure_threshold
                .unwrap_or(defaults.pressure_threshold),
            pressure_target: self.pressure_target.unwrap_or(defaults.pressure_target),
            memory_ttl: self.memory_ttl.unwrap_or(defaults.memory_ttl),
            shared_ttl: self.shared_ttl.unwrap_or(defaults.shared_ttl),
            persistent_ttl: self.persistent_ttl.unwrap_or(defaults.persistent_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            shared_timeout: self.shared_timeout.unwrap_or(defaults.shared_timeout),
            persistent_timeout: self
                .persistent_timeout
                .unwrap_or(defaults.persistent_timeout),
            lookup_timeout: self.lookup_timeout.unwrap_or(defaults.lookup_timeout),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
            enable_background_sweep: self
                .enable_background_sweep
                .unwrap_or(defaults.enable_background_sweep),
            promotion_frequency: self
                .promotion_frequency
                .unwrap_or(defaults.promotion_frequency),
            promotion_confidence: self
                .promotion_confidence
                .unwrap_or(defaults.promotion_confidence),
            payload_agreement: self.payload_agreement.unwrap_or(defaults.payload_agreement),
            knowledge_capacity: self
                .knowledge_capacity
                .unwrap_or(defaults.knowledge_capacity),
            knowledge_match_threshold: self
                .knowledge_match_threshold
                .unwrap_or(defaults.knowledge_match_threshold),
            stop_words: self.stop_words.unwrap_or(defaults.stop_words),
            ..defaults
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Rapidly changing answers: short lifetimes, strict similarity
    pub fn realtime() -> Self {
        Self {
            memory_ttl: Duration::from_secs(300),
            shared_ttl: Duration::from_secs(600),
            persistent_ttl: Duration::from_secs(24 * 3600),
            similarity_threshold: 0.95,
            sweep_interval: Duration::from_secs(15),
            ..Default::default()
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            memory_budget_bytes: 4 * 1024 * 1024,
            candidate_limit: 20,
            knowledge_capacity: 64,
            max_background_tasks: 8,
            ..Default::default()
        }
    }

    /// Large deployments with a generous memory tier
    pub fn large() -> Self {
        Self {
            memory_budget_bytes: 1024 * 1024 * 1024,
            candidate_limit: 100,
            knowledge_capacity: 1024,
            max_background_tasks: 256,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.similarity_threshold, 0.85);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.shared_timeout, Duration::from_millis(50));
        assert_eq!(config.persistent_timeout, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut invalid = CacheConfig::default();
        invalid.similarity_threshold = 1.5;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.memory_budget_bytes = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.pressure_target = 0.9;
        invalid.pressure_threshold = 0.8;
        assert!(invalid.validate().is_err());

        let mut invalid = CacheConfig::default();
        invalid.promotion_frequency = 1;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .similarity_threshold(0.9)
            .memory_budget_bytes(1024)
            .promotion_frequency(5)
            .build();

        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.memory_budget_bytes, 1024);
        assert_eq!(config.promotion_frequency, 5);
        assert_eq!(config.min_confidence, 0.7);
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            ttl_jitter: 0.1,
            ..Default::default()
        };

        let ttl = config.with_jitter(Duration::from_secs(3600));
        assert!(ttl.as_secs_f64() >= 3600.0 - 360.0);
        assert!(ttl.as_secs_f64() <= 3600.0 + 360.0);

        let exact = CacheConfig {
            ttl_jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(exact.with_jitter(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_preset_configs() {
        assert_eq!(CacheConfig::realtime().similarity_threshold, 0.95);
        assert_eq!(CacheConfig::small().memory_budget_bytes, 4 * 1024 * 1024);
        assert!(CacheConfig::large().validate().is_ok());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("OUROBOROS_CACHE_CANDIDATE_LIMIT", "17");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.candidate_limit, 17);
        std::env::remove_var("OUROBOROS_CACHE_CANDIDATE_LIMIT");
    }
}
