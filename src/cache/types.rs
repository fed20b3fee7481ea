//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 128-bit fingerprint rendered as 32 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Storage tier, ordered fastest to slowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process objects, byte-budgeted
    Memory,

    /// Out-of-process key-value store shared by cache instances
    Shared,

    /// Durable tier of record
    Persistent,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Shared => "shared",
            TierKind::Persistent => "persistent",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a lookup was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitKind {
    /// Curated knowledge pattern matched
    Knowledge,

    /// Exact fingerprint match in some tier
    Fingerprint,

    /// Token-overlap match above the similarity threshold
    Similar,

    /// Miss
    None,
}

impl fmt::Display for HitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitKind::Knowledge => write!(f, "knowledge"),
            HitKind::Fingerprint => write!(f, "fingerprint"),
            HitKind::Similar => write!(f, "similar"),
            HitKind::None => write!(f, "none"),
        }
    }
}

/// Caller-assigned eviction priority for the memory tier.
///
/// `Pinned` entries are never placed in the evictable heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Pinned,
}

/// Opaque response blob owned by the cache once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Approximate heap footprint in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Json(v) => v.to_string().len(),
        }
    }

    /// Textual rendering used for token estimates and payload agreement checks
    pub fn as_text(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Json(v) => v.to_string(),
        }
    }

    /// Rough token estimate: 1.3 tokens per whitespace-separated word
    pub fn estimated_tokens(&self) -> u64 {
        let words = self.as_text().split_whitespace().count();
        (words as f64 * 1.3) as u64
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

/// Point-in-time statistics snapshot returned by `Stats()`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Total lookups answered (including misses)
    pub lookups: u64,

    /// Lookups answered from any source
    pub hits: u64,

    /// Lookups returning `HitKind::None`
    pub misses: u64,

    /// Hits per source: memory, shared, persistent, knowledge, similar
    pub tier_hit_counts: BTreeMap<String, u64>,

    /// Memory-tier entries reclaimed by capacity pressure
    pub eviction_count: u64,

    /// Entries removed by the TTL sweep and low-quality purge
    pub expiration_count: u64,

    /// Explicit invalidations
    pub invalidation_count: u64,

    /// Clusters currently promoted into the knowledge store
    pub promoted_pattern_count: u64,

    /// Clusters demoted after contradicting payloads
    pub demoted_pattern_count: u64,

    /// Stores accepted / rejected
    pub stores_accepted: u64,
    pub stores_rejected: u64,

    /// Degraded tier failures absorbed as misses or failed writes
    pub tier_errors: u64,

    /// Memory tier occupancy
    pub memory_bytes: usize,
    pub memory_entries: usize,
    pub memory_budget_bytes: usize,

    /// Estimated backend tokens and cost avoided by hits
    pub tokens_saved: u64,
    pub cost_saved: f64,
}

impl CacheStats {
    /// Hit rate in [0, 1]
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    pub fn tier_hits(&self, source: &str) -> u64 {
        self.tier_hit_counts.get(source).copied().unwrap_or(0)
    }

    /// Memory occupancy as a fraction of the configured budget
    pub fn memory_occupancy(&self) -> f64 {
        if self.memory_budget_bytes == 0 {
            0.0
        } else {
            self.memory_bytes as f64 / self.memory_budget_bytes as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ lookups: {}, hits: {}, hit_rate: {:.2}%, evictions: {}, promoted: {}, memory: {}/{} bytes }}",
            self.lookups,
            self.hits,
            self.hit_rate() * 100.0,
            self.eviction_count,
            self.promoted_pattern_count,
            self.memory_bytes,
            self.memory_budget_bytes
        )
    }
}

/// Lock-free counters shared by the orchestrator, tiers and sweep task
#[derive(Debug, Default)]
pub struct StatsRecorder {
    lookups: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    shared_hits: AtomicU64,
    persistent_hits: AtomicU64,
    knowledge_hits: AtomicU64,
    similar_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    promoted: AtomicU64,
    demoted: AtomicU64,
    stores_accepted: AtomicU64,
    stores_rejected: AtomicU64,
    tier_errors: AtomicU64,
    tokens_saved: AtomicU64,
    cost_saved_microdollars: AtomicU64,
}

/// Where a hit came from, for per-source accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Tier(TierKind),
    Knowledge,
    Similar,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, source: HitSource) {
        let counter = match source {
            HitSource::Tier(TierKind::Memory) => &self.memory_hits,
            HitSource::Tier(TierKind::Shared) => &self.shared_hits,
            HitSource::Tier(TierKind::Persistent) => &self.persistent_hits,
            HitSource::Knowledge => &self.knowledge_hits,
            HitSource::Similar => &self.similar_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_savings(&self, tokens: u64, cost_per_1k_tokens: f64) {
        self.tokens_saved.fetch_add(tokens, Ordering::Relaxed);
        let micro = (tokens as f64 / 1000.0 * cost_per_1k_tokens * 1_000_000.0) as u64;
        self.cost_saved_microdollars
            .fetch_add(micro, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promoted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demoted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self, accepted: bool) {
        if accepted {
            self.stores_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stores_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tier_error(&self) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Build a snapshot; memory occupancy and live promoted-pattern count are
    /// supplied by the caller since they are owned elsewhere.
    pub fn snapshot(
        &self,
        memory_bytes: usize,
        memory_entries: usize,
        memory_budget_bytes: usize,
        promoted_pattern_count: u64,
    ) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        let mut tier_hit_counts = BTreeMap::new();
        tier_hit_counts.insert("memory".to_string(), load(&self.memory_hits));
        tier_hit_counts.insert("shared".to_string(), load(&self.shared_hits));
        tier_hit_counts.insert("persistent".to_string(), load(&self.persistent_hits));
        tier_hit_counts.insert("knowledge".to_string(), load(&self.knowledge_hits));
        tier_hit_counts.insert("similar".to_string(), load(&self.similar_hits));

        let hits = tier_hit_counts.values().sum();

        CacheStats {
            lookups: load(&self.lookups),
            hits,
            misses: load(&self.misses),
            tier_hit_counts,
            eviction_count: load(&self.evictions),
            expiration_count: load(&self.expirations),
            invalidation_count: load(&self.invalidations),
            promoted_pattern_count,
            demoted_pattern_count: load(&self.demoted),
            stores_accepted: load(&self.stores_accepted),
            stores_rejected: load(&self.stores_rejected),
            tier_errors: load(&self.tier_errors),
            memory_bytes,
            memory_entries,
            memory_budget_bytes,
            tokens_saved: load(&self.tokens_saved),
            cost_saved: load(&self.cost_saved_microdollars) as f64 / 1_000_000.0,
        }
    }

    /// Total promotions ever recorded (monotonic)
    pub fn promotions_total(&self) -> u64 {
        self.promoted.load(Ordering::Relaxed)
    }
}
