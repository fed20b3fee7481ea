//! Public cache facade
//!
//! [`CacheOrchestrator`] sequences the resolver chain on lookup, writes
//! through the tiers on store (tier of record first), feeds the pattern
//! learner and owns the background sweep lifecycle.

use crate::cache::config::CacheConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::eviction::{EvictionConfig, EvictionManager, SweepHandle};
use crate::cache::fingerprint::FingerprintIndex;
use crate::cache::invalidation::{InvalidationEvent, InvalidationReason};
use crate::cache::knowledge::KnowledgeStore;
use crate::cache::learner::PatternLearner;
use crate::cache::normalize::Normalizer;
use crate::cache::resolver::{
    FingerprintResolver, KnowledgeResolver, LookupContext, Resolution, Resolver,
    SimilarityChainResolver,
};
use crate::cache::tier::{MemoryTier, TierSet, TierStore};
use crate::cache::types::{CacheStats, Fingerprint, HitKind, Payload, Priority, StatsRecorder, TierKind};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Answer to a lookup
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub payload: Option<Payload>,
    pub hit_kind: HitKind,

    /// Similarity or knowledge score, for caller transparency
    pub score: Option<f64>,

    /// Fingerprint of the query; `None` for blank queries
    pub fingerprint: Option<Fingerprint>,
}

impl LookupResult {
    fn miss(fingerprint: Option<Fingerprint>) -> Self {
        Self {
            payload: None,
            hit_kind: HitKind::None,
            score: None,
            fingerprint,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.hit_kind != HitKind::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Confidence below `min_confidence`
    LowConfidence,

    /// The tier of record refused or failed the write
    NotPersisted,

    /// The aggregate store deadline passed
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(Fingerprint),
    Rejected(RejectReason),
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored(_))
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            StoreOutcome::Stored(fp) => Some(fp),
            StoreOutcome::Rejected(_) => None,
        }
    }
}

/// Per-store overrides
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Absolute lifetime; tier defaults apply when `None`
    pub ttl: Option<Duration>,
    pub priority: Priority,
}

impl StoreOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Row of the most-used report
#[derive(Debug, Clone, PartialEq)]
pub struct TopEntry {
    pub fingerprint: Fingerprint,
    pub tenant: String,
    pub category: String,
    pub usage_count: u64,
    pub last_used_at: DateTime<Utc>,
}

const FENCE_STRIPES: usize = 64;

/// Striped invalidation counters. An invalidate bumps `started` before it
/// deletes and `finished` once it is done; a promotion may only copy an entry
/// into a faster tier if no invalidate of its stripe began after the read.
struct InvalidationFence {
    started: Vec<AtomicU64>,
    finished: Vec<AtomicU64>,
}

/// Per-stripe `started` counts; `None` where an invalidate was in flight
struct FenceSnapshot(Vec<Option<u64>>);

struct FenceGuard<'a> {
    fence: &'a InvalidationFence,
    stripe: usize,
}

impl InvalidationFence {
    fn new() -> Self {
        Self {
            started: (0..FENCE_STRIPES).map(|_| AtomicU64::new(0)).collect(),
            finished: (0..FENCE_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(key: &Fingerprint) -> usize {
        key.as_str()
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % FENCE_STRIPES
    }

    /// Taken before any tier is read
    fn snapshot(&self) -> FenceSnapshot {
        FenceSnapshot(
            self.started
                .iter()
                .zip(&self.finished)
                .map(|(started, finished)| {
                    let started = started.load(Ordering::SeqCst);
                    (finished.load(Ordering::SeqCst) == started).then_some(started)
                })
                .collect(),
        )
    }

    fn is_current(&self, snapshot: &FenceSnapshot, key: &Fingerprint) -> bool {
        let stripe = Self::stripe(key);
        let taken = snapshot.0.get(stripe).copied().flatten();
        taken.is_some() && taken == self.started.get(stripe).map(|s| s.load(Ordering::SeqCst))
    }

    fn begin(&self, key: &Fingerprint) -> FenceGuard<'_> {
        let stripe = Self::stripe(key);
        if let Some(started) = self.started.get(stripe) {
            started.fetch_add(1, Ordering::SeqCst);
        }
        FenceGuard {
            fence: self,
            stripe,
        }
    }
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        if let Some(finished) = self.fence.finished.get(self.stripe) {
            finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct CacheOrchestratorBuilder {
    config: CacheConfig,
    shared: Option<Arc<dyn TierStore>>,
    persistent: Option<Arc<dyn TierStore>>,
    knowledge: Option<Arc<KnowledgeStore>>,
}

impl CacheOrchestratorBuilder {
    pub fn shared_tier(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.shared = Some(tier);
        self
    }

    pub fn persistent_tier(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.persistent = Some(tier);
        self
    }

    /// Start from an existing (e.g. reloaded) knowledge store
    pub fn knowledge_store(mut self, knowledge: Arc<KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn build(self) -> Result<CacheOrchestrator> {
        self.config.validate()?;
        let persistent = self.persistent.ok_or_else(|| {
            CacheError::ConfigError("a persistent tier is required".to_string())
        })?;

        let config = self.config;
        let stats = Arc::new(StatsRecorder::new());
        let memory = Arc::new(MemoryTier::new(config.memory_budget_bytes));
        let tiers = Arc::new(TierSet::new(
            config.clone(),
            memory,
            self.shared,
            persistent,
            Arc::clone(&stats),
        ));

        let knowledge = self.knowledge.unwrap_or_else(|| {
            Arc::new(KnowledgeStore::new(
                config.knowledge_capacity,
                config.knowledge_match_threshold,
            ))
        });
        let learner = Arc::new(PatternLearner::new(&config, Arc::clone(&knowledge)));

        let chain: Vec<Box<dyn Resolver>> = vec![
            Box::new(KnowledgeResolver::new(knowledge)),
            Box::new(FingerprintResolver::new(Arc::clone(&tiers))),
            Box::new(SimilarityChainResolver::new(
                Arc::clone(&tiers),
                config.similarity_threshold,
                config.candidate_limit,
            )),
        ];

        let eviction = Arc::new(EvictionManager::new(
            EvictionConfig::from(&config),
            Arc::clone(&tiers),
            Arc::clone(&stats),
        ));

        info!(
            "Initializing cache orchestrator: tiers {:?}, memory budget {} bytes",
            tiers.kinds(),
            config.memory_budget_bytes
        );

        Ok(CacheOrchestrator {
            normalizer: Normalizer::new(&config.stop_words),
            fingerprints: FingerprintIndex::new(),
            background: Arc::new(Semaphore::new(config.max_background_tasks)),
            fence: Arc::new(InvalidationFence::new()),
            config,
            tiers,
            chain,
            learner,
            stats,
            eviction,
            sweep: Mutex::new(None),
        })
    }
}

/// Lookup, store and invalidate across the knowledge store and the three tiers
pub struct CacheOrchestrator {
    config: CacheConfig,
    normalizer: Normalizer,
    fingerprints: FingerprintIndex,
    tiers: Arc<TierSet>,
    chain: Vec<Box<dyn Resolver>>,
    learner: Arc<PatternLearner>,
    stats: Arc<StatsRecorder>,
    eviction: Arc<EvictionManager>,
    sweep: Mutex<Option<SweepHandle>>,

    /// Bounds fire-and-forget promotion work
    background: Arc<Semaphore>,

    /// Keeps promotions from resurrecting invalidated entries
    fence: Arc<InvalidationFence>,
}

impl CacheOrchestrator {
    pub fn builder(config: CacheConfig) -> CacheOrchestratorBuilder {
        CacheOrchestratorBuilder {
            config,
            shared: None,
            persistent: None,
            knowledge: None,
        }
    }

    /// Memory plus the given tier of record, no shared tier
    pub fn new(config: CacheConfig, persistent: Arc<dyn TierStore>) -> Result<Self> {
        Self::builder(config).persistent_tier(persistent).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tiers(&self) -> &Arc<TierSet> {
        &self.tiers
    }

    pub fn learner(&self) -> &Arc<PatternLearner> {
        &self.learner
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        self.learner.knowledge()
    }

    /// Fingerprint a raw query the way lookups and stores do
    pub fn fingerprint_of(&self, query: &str, tenant: &str) -> Fingerprint {
        let normalized = self.normalizer.normalize(query);
        self.fingerprints.fingerprint(&normalized.canonical, tenant)
    }

    fn check_query(&self, query: &str) -> Result<()> {
        let chars = query.chars().count();
        if chars > self.config.max_query_chars {
            return Err(CacheError::Validation(format!(
                "query of {} characters exceeds limit of {}",
                chars, self.config.max_query_chars
            )));
        }
        Ok(())
    }

    /// Look up within the configured `lookup_timeout`. Never fails: invalid
    /// input and an exceeded deadline are reported as a miss.
    pub async fn lookup(&self, query: &str, tenant: &str, category: &str) -> LookupResult {
        let deadline = Instant::now() + self.config.lookup_timeout;
        match self
            .lookup_with_deadline(query, tenant, category, deadline)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Lookup degraded to miss: {}", e);
                LookupResult::miss(None)
            }
        }
    }

    /// Look up, failing with [`CacheError::DeadlineExceeded`] if the chain
    /// has not answered by `deadline`
    pub async fn lookup_with_deadline(
        &self,
        query: &str,
        tenant: &str,
        category: &str,
        deadline: Instant,
    ) -> Result<LookupResult> {
        self.stats.record_lookup();

        if let Err(e) = self.check_query(query) {
            self.stats.record_miss();
            return Err(e);
        }

        let normalized = self.normalizer.normalize(query);
        if normalized.is_empty() {
            debug!("Blank query after normalization, miss");
            self.stats.record_miss();
            return Ok(LookupResult::miss(None));
        }

        let ctx = LookupContext {
            fingerprint: self.fingerprints.fingerprint(&normalized.canonical, tenant),
            tenant: tenant.to_string(),
            category: category.to_string(),
            normalized,
        };

        let snapshot = self.fence.snapshot();
        match timeout_at(deadline, self.resolve(&ctx)).await {
            Ok(Some(resolution)) => {
                self.stats.record_hit(resolution.source);
                self.stats.record_savings(
                    resolution.payload.estimated_tokens(),
                    self.config.cost_per_1k_tokens,
                );
                self.promote(&resolution, snapshot).await;

                Ok(LookupResult {
                    payload: Some(resolution.payload),
                    hit_kind: resolution.hit_kind,
                    score: resolution.score,
                    fingerprint: Some(ctx.fingerprint),
                })
            }
            Ok(None) => {
                debug!("Cache miss for {}", ctx.fingerprint);
                self.stats.record_miss();
                Ok(LookupResult::miss(Some(ctx.fingerprint)))
            }
            Err(_) => {
                self.stats.record_miss();
                Err(CacheError::DeadlineExceeded {
                    operation: "lookup".to_string(),
                })
            }
        }
    }

    async fn resolve(&self, ctx: &LookupContext) -> Option<Resolution> {
        for resolver in &self.chain {
            if let Some(resolution) = resolver.resolve(ctx).await {
                debug!(
                    "{} resolver answered {} ({})",
                    resolver.name(),
                    ctx.fingerprint,
                    resolution.hit_kind
                );
                return Some(resolution);
            }
            debug!("{} resolver missed {}", resolver.name(), ctx.fingerprint);
        }
        None
    }

    /// Refresh usage and copy the entry into faster tiers. Memory is updated
    /// inline; everything slower runs in the background. A copy that races
    /// an invalidate of the same entry is removed again.
    async fn promote(&self, resolution: &Resolution, snapshot: FenceSnapshot) {
        let Some(mut entry) = resolution.entry.clone() else {
            return;
        };
        entry.mark_used();

        if resolution.found_in != Some(TierKind::Memory)
            && !self.fence.is_current(&snapshot, &entry.fingerprint)
        {
            debug!(
                "Entry {} invalidated during lookup, not promoted",
                entry.fingerprint
            );
            return;
        }

        if resolution.found_in == Some(TierKind::Memory) {
            self.tiers
                .touch(
                    TierKind::Memory,
                    &entry.fingerprint,
                    entry.usage_count,
                    entry.last_used_at,
                )
                .await;
        } else if let Err(e) = self.tiers.put(TierKind::Memory, &entry).await {
            debug!("Entry {} not promoted into memory: {}", entry.fingerprint, e);
        } else if !self.fence.is_current(&snapshot, &entry.fingerprint) {
            self.tiers.delete(TierKind::Memory, &entry.fingerprint).await;
        }

        let fill_shared = resolution.found_in == Some(TierKind::Persistent);
        let tiers = Arc::clone(&self.tiers);
        let fence = Arc::clone(&self.fence);
        self.spawn_background("promotion", async move {
            if fill_shared
                && fence.is_current(&snapshot, &entry.fingerprint)
                && tiers.put_best_effort(TierKind::Shared, &entry).await
                && !fence.is_current(&snapshot, &entry.fingerprint)
            {
                debug!(
                    "Entry {} invalidated during promotion, dropping shared copy",
                    entry.fingerprint
                );
                tiers.delete(TierKind::Shared, &entry.fingerprint).await;
            }
            tiers
                .touch(
                    TierKind::Persistent,
                    &entry.fingerprint,
                    entry.usage_count,
                    entry.last_used_at,
                )
                .await;
        });
    }

    fn spawn_background<F>(&self, what: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.background).try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            Err(_) => debug!("Background queue full, skipping {}", what),
        }
    }

    pub async fn store(
        &self,
        query: &str,
        tenant: &str,
        category: &str,
        payload: impl Into<Payload>,
        confidence: f64,
    ) -> Result<StoreOutcome> {
        self.store_with_options(
            query,
            tenant,
            category,
            payload,
            confidence,
            StoreOptions::default(),
        )
        .await
    }

    /// Store within the configured `lookup_timeout`; an exceeded deadline is
    /// reported as [`RejectReason::DeadlineExceeded`]
    pub async fn store_with_options(
        &self,
        query: &str,
        tenant: &str,
        category: &str,
        payload: impl Into<Payload>,
        confidence: f64,
        options: StoreOptions,
    ) -> Result<StoreOutcome> {
        let deadline = Instant::now() + self.config.lookup_timeout;
        match self
            .store_with_deadline(query, tenant, category, payload, confidence, options, deadline)
            .await
        {
            Err(CacheError::DeadlineExceeded { .. }) => {
                warn!("Store for tenant {} ran out of time, rejected", tenant);
                Ok(StoreOutcome::Rejected(RejectReason::DeadlineExceeded))
            }
            other => other,
        }
    }

    /// Store, failing with [`CacheError::DeadlineExceeded`] if the write path
    /// has not finished by `deadline`. Writes already committed stay in place.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_with_deadline(
        &self,
        query: &str,
        tenant: &str,
        category: &str,
        payload: impl Into<Payload>,
        confidence: f64,
        options: StoreOptions,
        deadline: Instant,
    ) -> Result<StoreOutcome> {
        let payload = payload.into();

        self.check_query(query)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(CacheError::Validation(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }
        let payload_bytes = payload.size_bytes();
        if payload_bytes > self.config.max_payload_bytes {
            return Err(CacheError::Validation(format!(
                "payload of {} bytes exceeds limit of {}",
                payload_bytes, self.config.max_payload_bytes
            )));
        }

        let normalized = self.normalizer.normalize(query);
        if normalized.is_empty() {
            return Err(CacheError::Validation(
                "query is empty after normalization".to_string(),
            ));
        }

        if confidence < self.config.min_confidence {
            debug!(
                "Rejecting store with confidence {:.2} below {:.2}",
                confidence, self.config.min_confidence
            );
            self.stats.record_store(false);
            return Ok(StoreOutcome::Rejected(RejectReason::LowConfidence));
        }

        let fingerprint = self.fingerprints.fingerprint(&normalized.canonical, tenant);
        let mut entry = CacheEntry::new(
            fingerprint,
            tenant,
            category,
            &normalized,
            payload,
            confidence,
        )
        .with_priority(options.priority);
        if let Some(ttl) = options.ttl {
            entry = entry.with_ttl(ttl);
        }

        match timeout_at(deadline, self.write_through(entry)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.stats.record_store(false);
                Err(CacheError::DeadlineExceeded {
                    operation: "store".to_string(),
                })
            }
        }
    }

    /// Tier of record first, then shared and memory best-effort, then the learner
    async fn write_through(&self, mut entry: CacheEntry) -> Result<StoreOutcome> {
        // Usage history outlives the memory copy
        let previous = match self.tiers.get(TierKind::Memory, &entry.fingerprint).await {
            Some(previous) => Some(previous),
            None => self.tiers.get(TierKind::Persistent, &entry.fingerprint).await,
        };
        if let Some(previous) = previous {
            entry.inherit(&previous);
        }

        if let Err(e) = self.tiers.put(TierKind::Persistent, &entry).await {
            self.stats.record_store(false);
            if !e.is_degradable() {
                return Err(e);
            }
            warn!(
                "Store of {} rejected, tier of record failed: {}",
                entry.fingerprint, e
            );
            self.stats.record_tier_error();
            return Ok(StoreOutcome::Rejected(RejectReason::NotPersisted));
        }

        self.tiers.put_best_effort(TierKind::Shared, &entry).await;
        if let Err(e) = self.tiers.put(TierKind::Memory, &entry).await {
            warn!("Entry {} not cached in memory: {}", entry.fingerprint, e);
        }

        let observed = self.learner.observe(&entry).await;
        if observed.promoted {
            self.stats.record_promotion();
        }
        if observed.demoted {
            self.stats.record_demotion();
        }

        self.stats.record_store(true);
        debug!("Stored {} for tenant {}", entry.fingerprint, entry.tenant);
        Ok(StoreOutcome::Stored(entry.fingerprint))
    }

    /// Remove from every tier (memory synchronously first) and from pattern
    /// clusters. Invalidating an unknown fingerprint is a no-op.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = {
            let _fence = self.fence.begin(fingerprint);
            self.tiers.delete_everywhere(fingerprint).await
        };
        self.learner.forget(fingerprint).await;

        if removed {
            self.stats.record_invalidation();
            self.tiers
                .invalidations()
                .record(InvalidationEvent::new(
                    InvalidationReason::Manual,
                    vec![fingerprint.clone()],
                ))
                .await;
            info!("Invalidated {}", fingerprint);
        } else {
            debug!("Invalidate of unknown fingerprint {}", fingerprint);
        }
        removed
    }

    /// [`invalidate`](Self::invalidate) by raw query
    pub async fn invalidate_query(&self, query: &str, tenant: &str) -> Result<bool> {
        self.check_query(query)?;
        Ok(self.invalidate(&self.fingerprint_of(query, tenant)).await)
    }

    pub async fn stats(&self) -> CacheStats {
        let memory = self.tiers.memory();
        let (used_bytes, entries) = memory.usage().await;
        self.stats.snapshot(
            used_bytes,
            entries,
            memory.budget_bytes(),
            self.learner.promoted_count().await,
        )
    }

    /// Most used memory-tier entries
    pub async fn top_entries(&self, limit: usize) -> Vec<TopEntry> {
        self.tiers
            .memory()
            .top_entries(limit)
            .await
            .into_iter()
            .map(|e| TopEntry {
                fingerprint: e.fingerprint,
                tenant: e.tenant,
                category: e.category,
                usage_count: e.usage_count,
                last_used_at: e.last_used_at,
            })
            .collect()
    }

    /// Up to `limit` recent invalidation events, newest first
    pub async fn recent_invalidations(&self, limit: usize) -> Vec<InvalidationEvent> {
        self.tiers.invalidations().recent(limit).await
    }

    /// Run one sweep pass immediately
    pub async fn sweep_now(&self) -> Vec<InvalidationEvent> {
        self.eviction.run_once().await
    }

    /// Spawn the periodic sweep; a no-op if disabled or already running
    pub async fn start(&self) {
        if !self.config.enable_background_sweep {
            info!("Background sweep disabled by configuration");
            return;
        }

        let mut sweep = self.sweep.lock().await;
        if sweep.is_some() {
            return;
        }
        *sweep = Some(self.eviction.start());
    }

    /// Stop the sweep and wait for background promotion work to drain
    pub async fn stop(&self) {
        if let Some(handle) = self.sweep.lock().await.take() {
            handle.stop().await;
        }
        self.settle().await;
        info!("Cache orchestrator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.sweep
            .lock()
            .await
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// Wait until no background promotion task is in flight
    pub async fn settle(&self) {
        let permits = self.config.max_background_tasks as u32;
        if let Ok(all) = self.background.acquire_many(permits).await {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tier::FileTier;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    async fn orchestrator(config: CacheConfig) -> (CacheOrchestrator, TempDir) {
        let dir = TempDir::new().unwrap();
        let persistent = Arc::new(FileTier::open(dir.path()).await.unwrap());
        let cache = CacheOrchestrator::new(config, persistent).unwrap();
        (cache, dir)
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let (cache, _dir) = orchestrator(CacheConfig::default()).await;

        let outcome = assert_ok!(
            cache
                .store("What is the refund policy?", "acme", "billing", "14 days", 0.9)
                .await
        );
        assert!(outcome.is_stored());

        let result = cache.lookup("what is the REFUND policy", "acme", "billing").await;
        assert_eq!(result.hit_kind, HitKind::Fingerprint);
        assert_eq!(result.payload, Some(Payload::from("14 days")));
        assert_eq!(result.fingerprint.as_ref(), outcome.fingerprint());
    }

    #[tokio::test]
    async fn test_low_confidence_rejected() {
        let (cache, _dir) = orchestrator(CacheConfig::default()).await;
        let outcome = cache
            .store("refund policy", "acme", "billing", "14 days", 0.5)
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Rejected(RejectReason::LowConfidence));
        assert!(!cache.lookup("refund policy", "acme", "billing").await.is_hit());
        assert_eq!(cache.stats().await.stores_rejected, 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let config = CacheConfig::builder().max_query_chars(16).build();
        let (cache, _dir) = orchestrator(config).await;

        let oversized = "x".repeat(17);
        for (query, confidence) in [(oversized.as_str(), 0.9), ("refund", 1.5), ("?!", 0.9)] {
            let err = assert_err!(cache.store(query, "acme", "billing", "a", confidence).await);
            assert!(matches!(err, CacheError::Validation(_)), "got {:?}", err);
        }

        let result = cache.lookup(&oversized, "acme", "billing").await;
        assert_eq!(result.hit_kind, HitKind::None);
    }

    #[tokio::test]
    async fn test_persistent_hit_promotes_into_memory() {
        let (cache, _dir) = orchestrator(CacheConfig::default()).await;
        let fp = cache
            .store("refund policy", "acme", "billing", "14 days", 0.9)
            .await
            .unwrap()
            .fingerprint()
            .cloned()
            .unwrap();

        cache.tiers().memory().delete(&fp).await.unwrap();

        let first = cache.lookup("refund policy", "acme", "billing").await;
        assert_eq!(first.hit_kind, HitKind::Fingerprint);
        cache.settle().await;

        let stats = cache.stats().await;
        assert_eq!(stats.tier_hits("persistent"), 1);

        cache.lookup("refund policy", "acme", "billing").await;
        let stats = cache.stats().await;
        assert_eq!(stats.tier_hits("memory"), 1);
        assert!(stats.tokens_saved > 0);
    }

    #[test]
    fn test_fence_blocks_writes_that_race_an_invalidate() {
        let fence = InvalidationFence::new();
        let key = Fingerprint::from("abc");

        let before = fence.snapshot();
        assert!(fence.is_current(&before, &key));
        drop(fence.begin(&key));
        assert!(!fence.is_current(&before, &key));

        let guard = fence.begin(&key);
        let during = fence.snapshot();
        assert!(!fence.is_current(&during, &key));
        drop(guard);

        let after = fence.snapshot();
        assert!(fence.is_current(&after, &key));
    }

    #[tokio::test]
    async fn test_expired_deadline() {
        let (cache, _dir) = orchestrator(CacheConfig::default()).await;
        let past = Instant::now() - Duration::from_millis(1);

        let lookup = cache
            .lookup_with_deadline("refund policy", "acme", "billing", past)
            .await;
        assert!(matches!(lookup, Err(CacheError::DeadlineExceeded { .. })));

        let store = cache
            .store_with_deadline(
                "refund policy",
                "acme",
                "billing",
                "14 days",
                0.9,
                StoreOptions::default(),
                past,
            )
            .await;
        assert!(matches!(store, Err(CacheError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_top_entries_orders_by_usage() {
        let (cache, _dir) = orchestrator(CacheConfig::default()).await;
        cache.store("refund policy", "acme", "billing", "a", 0.9).await.unwrap();
        cache.store("shipping times", "acme", "billing", "b", 0.9).await.unwrap();
        for _ in 0..3 {
            cache.lookup("shipping times", "acme", "billing").await;
        }

        let top = cache.top_entries(1).await;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].fingerprint, cache.fingerprint_of("shipping times", "acme"));
        assert_eq!(top[0].usage_count, 4);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let config = CacheConfig::builder()
            .sweep_interval(Duration::from_millis(20))
            .build();
        let (cache, _dir) = orchestrator(config).await;

        cache.start().await;
        cache.start().await;
        assert!(cache.is_running().await);

        cache.stop().await;
        assert!(!cache.is_running().await);
    }

    #[tokio::test]
    async fn test_missing_persistent_tier_is_config_error() {
        let result = CacheOrchestrator::builder(CacheConfig::default()).build();
        assert!(matches!(result, Err(CacheError::ConfigError(_))));
    }
}
