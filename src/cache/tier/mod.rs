//! Storage tiers and the timeout/degradation layer around them
//!
//! Every tier implements [`TierStore`]. [`TierSet`] bounds each call with the
//! tier's timeout and turns shared/persistent failures into misses or logged
//! write failures, so no caller ever blocks indefinitely on a single backend.

pub mod graph;
pub mod memory;
pub mod persistent;
pub mod shared;

pub use graph::Neo4jTier;
pub use memory::MemoryTier;
pub use persistent::{FileTier, PersistentRecord};
pub use shared::{InProcessKv, KeyValueBackend, RedisKv, SharedTier};

use crate::cache::config::CacheConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::invalidation::{InvalidationEvent, InvalidationLog, InvalidationReason};
use crate::cache::types::{Fingerprint, StatsRecorder, TierKind};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Minimal contract shared by all tiers
#[async_trait]
pub trait TierStore: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Live entry for `key`; expired entries are treated as absent
    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Insert or replace, expiring `ttl` from now
    async fn set(&self, key: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> Result<()>;

    /// Returns whether anything was removed
    async fn delete(&self, key: &Fingerprint) -> Result<bool>;

    /// Raise `usage_count` to at least `usage_count` and refresh `last_used_at`.
    /// A missing key is not an error.
    async fn touch(
        &self,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recently used live entries for one tenant and category
    async fn scan_recent(
        &self,
        tenant: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;

    /// Remove expired (and, where the tier supports it, stale) entries.
    /// Unreadable entries are counted and skipped.
    async fn sweep_expired(&self, policy: &SweepPolicy) -> Result<SweepReport>;
}

/// What the sweep removes
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub now: DateTime<Utc>,

    /// Entries created before this are eligible for the low-quality purge
    pub stale_before: Option<DateTime<Utc>>,

    pub stale_confidence: f64,
}

impl SweepPolicy {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            stale_before: None,
            stale_confidence: 0.0,
        }
    }

    pub fn with_stale_purge(mut self, age: chrono::Duration, confidence: f64) -> Self {
        self.stale_before = Some(self.now - age);
        self.stale_confidence = confidence;
        self
    }

    /// Single-use, low-confidence and old
    pub fn is_stale(&self, usage_count: u64, confidence: f64, created_at: DateTime<Utc>) -> bool {
        match self.stale_before {
            Some(cutoff) => {
                usage_count <= 1 && confidence < self.stale_confidence && created_at < cutoff
            }
            None => false,
        }
    }
}

/// Outcome of one tier sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub expired: Vec<Fingerprint>,
    pub purged: Vec<Fingerprint>,
    /// Undecodable records deleted during the sweep
    pub corrupt: Vec<Fingerprint>,
    pub errors: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.purged.len() + self.corrupt.len()
    }
}

/// Run a tier call under a timeout, mapping elapsed time to `CacheError::Timeout`
pub(crate) async fn bounded<T, F>(tier: TierKind, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout {
            tier,
            millis: limit.as_millis() as u64,
        }),
    }
}

/// The three tiers, fastest first, with per-tier lifetimes and timeouts
pub struct TierSet {
    memory: Arc<MemoryTier>,
    shared: Option<Arc<dyn TierStore>>,
    persistent: Arc<dyn TierStore>,
    config: CacheConfig,
    stats: Arc<StatsRecorder>,
    invalidations: Arc<InvalidationLog>,
}

impl TierSet {
    pub fn new(
        config: CacheConfig,
        memory: Arc<MemoryTier>,
        shared: Option<Arc<dyn TierStore>>,
        persistent: Arc<dyn TierStore>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            memory,
            shared,
            persistent,
            config,
            stats,
            invalidations: Arc::new(InvalidationLog::default()),
        }
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    /// Removals performed through this set, and by the sweep over it
    pub fn invalidations(&self) -> &Arc<InvalidationLog> {
        &self.invalidations
    }

    /// Tiers present, fastest first
    pub fn kinds(&self) -> Vec<TierKind> {
        let mut kinds = vec![TierKind::Memory];
        if self.shared.is_some() {
            kinds.push(TierKind::Shared);
        }
        kinds.push(TierKind::Persistent);
        kinds
    }

    fn store(&self, kind: TierKind) -> Option<&dyn TierStore> {
        match kind {
            TierKind::Memory => Some(self.memory.as_ref() as &dyn TierStore),
            TierKind::Shared => self.shared.as_deref(),
            TierKind::Persistent => Some(self.persistent.as_ref()),
        }
    }

    fn timeout(&self, kind: TierKind) -> Duration {
        match kind {
            // In-process; the lock is never held across I/O
            TierKind::Memory => self.config.persistent_timeout,
            TierKind::Shared => self.config.shared_timeout,
            TierKind::Persistent => self.config.persistent_timeout,
        }
    }

    fn default_ttl(&self, kind: TierKind) -> Duration {
        let base = match kind {
            TierKind::Memory => self.config.memory_ttl,
            TierKind::Shared => self.config.shared_ttl,
            TierKind::Persistent => self.config.persistent_ttl,
        };
        self.config.with_jitter(base)
    }

    fn degrade(&self, kind: TierKind, op: &str, error: &CacheError) {
        warn!("{} tier {} failed, degrading: {}", kind, op, error);
        self.stats.record_tier_error();
    }

    /// Read one tier. Failures and corrupt entries become misses; a corrupt
    /// entry is deleted so the next read does not trip over it again.
    pub async fn get(&self, kind: TierKind, key: &Fingerprint) -> Option<CacheEntry> {
        let store = self.store(kind)?;

        match bounded(kind, self.timeout(kind), store.get(key)).await {
            Ok(entry) => entry,
            Err(CacheError::CorruptEntry { message, .. }) => {
                warn!("Dropping corrupt entry {} in {} tier: {}", key, kind, message);
                self.stats.record_tier_error();
                match bounded(kind, self.timeout(kind), store.delete(key)).await {
                    Ok(_) => {
                        self.invalidations
                            .record(
                                InvalidationEvent::new(InvalidationReason::Corrupt, vec![key.clone()])
                                    .in_tier(kind)
                                    .with_context(message),
                            )
                            .await
                    }
                    Err(e) => self.degrade(kind, "delete", &e),
                }
                None
            }
            Err(e) => {
                self.degrade(kind, "get", &e);
                None
            }
        }
    }

    /// Write one tier. Errors are returned; the orchestrator decides whether
    /// the failure rejects the store.
    pub async fn put(&self, kind: TierKind, entry: &CacheEntry) -> Result<()> {
        let ttl = match entry.tier_ttl(self.default_ttl(kind)) {
            Some(ttl) => ttl,
            None => {
                debug!("Skipping {} write of expired entry {}", kind, entry.fingerprint);
                return Ok(());
            }
        };

        if kind == TierKind::Memory {
            let evicted = self.memory.insert(entry.clone(), ttl).await?;
            if !evicted.is_empty() {
                debug!("Evicted {} memory entries to admit {}", evicted.len(), entry.fingerprint);
                self.stats.record_evictions(evicted.len() as u64);
                self.invalidations
                    .record(
                        InvalidationEvent::new(InvalidationReason::SizeLimit, evicted)
                            .in_tier(TierKind::Memory),
                    )
                    .await;
            }
            return Ok(());
        }

        let store = self
            .store(kind)
            .ok_or_else(|| CacheError::unavailable(kind, "tier not configured"))?;
        bounded(kind, self.timeout(kind), store.set(&entry.fingerprint, entry, ttl)).await
    }

    /// Best-effort write; failures are logged and counted
    pub async fn put_best_effort(&self, kind: TierKind, entry: &CacheEntry) -> bool {
        if self.store(kind).is_none() {
            return false;
        }
        match self.put(kind, entry).await {
            Ok(()) => true,
            Err(e) => {
                self.degrade(kind, "set", &e);
                false
            }
        }
    }

    pub async fn touch(
        &self,
        kind: TierKind,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) {
        let Some(store) = self.store(kind) else {
            return;
        };
        if let Err(e) = bounded(
            kind,
            self.timeout(kind),
            store.touch(key, usage_count, last_used_at),
        )
        .await
        {
            self.degrade(kind, "touch", &e);
        }
    }

    /// Best-effort removal from one tier
    pub async fn delete(&self, kind: TierKind, key: &Fingerprint) -> bool {
        let Some(store) = self.store(kind) else {
            return false;
        };
        match bounded(kind, self.timeout(kind), store.delete(key)).await {
            Ok(found) => found,
            Err(e) => {
                self.degrade(kind, "delete", &e);
                false
            }
        }
    }

    /// Remove from every tier, memory first and synchronously.
    /// Returns whether any tier held the key.
    pub async fn delete_everywhere(&self, key: &Fingerprint) -> bool {
        let mut removed = match self.memory.delete(key).await {
            Ok(found) => found,
            Err(e) => {
                self.degrade(TierKind::Memory, "delete", &e);
                false
            }
        };

        for kind in [TierKind::Shared, TierKind::Persistent] {
            let Some(store) = self.store(kind) else {
                continue;
            };
            match bounded(kind, self.timeout(kind), store.delete(key)).await {
                Ok(found) => removed |= found,
                Err(e) => self.degrade(kind, "delete", &e),
            }
        }

        removed
    }

    /// Similarity candidates from memory and shared, memory copies winning,
    /// capped at `limit` per tier
    pub async fn candidates(&self, tenant: &str, category: &str, limit: usize) -> Vec<CacheEntry> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for kind in [TierKind::Memory, TierKind::Shared] {
            let Some(store) = self.store(kind) else {
                continue;
            };
            match bounded(
                kind,
                self.timeout(kind),
                store.scan_recent(tenant, category, limit),
            )
            .await
            {
                Ok(entries) => {
                    for entry in entries {
                        if seen.insert(entry.fingerprint.clone()) {
                            out.push(entry);
                        }
                    }
                }
                Err(e) => self.degrade(kind, "scan", &e),
            }
        }

        out
    }

    pub async fn sweep(
        &self,
        kind: TierKind,
        policy: &SweepPolicy,
        limit: Duration,
    ) -> Result<SweepReport> {
        let store = self
            .store(kind)
            .ok_or_else(|| CacheError::unavailable(kind, "tier not configured"))?;

        // The low-quality purge only applies to the tier of record
        let policy = if kind == TierKind::Persistent {
            policy.clone()
        } else {
            SweepPolicy::new(policy.now)
        };

        bounded(kind, limit, store.sweep_expired(&policy)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_policy() {
        let now = Utc::now();
        let policy = SweepPolicy::new(now).with_stale_purge(chrono::Duration::days(7), 0.8);
        let old = now - chrono::Duration::days(8);
        let recent = now - chrono::Duration::days(1);

        assert!(policy.is_stale(1, 0.75, old));
        assert!(!policy.is_stale(2, 0.75, old));
        assert!(!policy.is_stale(1, 0.85, old));
        assert!(!policy.is_stale(1, 0.75, recent));
        assert!(!SweepPolicy::new(now).is_stale(1, 0.1, old));
    }

    #[tokio::test]
    async fn test_bounded_maps_elapsed_to_timeout() {
        let result: Result<()> = bounded(TierKind::Shared, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        match result {
            Err(CacheError::Timeout { tier, millis }) => {
                assert_eq!(tier, TierKind::Shared);
                assert_eq!(millis, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_sweep_report_removed() {
        let report = SweepReport {
            expired: vec![Fingerprint::from("a")],
            purged: vec![Fingerprint::from("b"), Fingerprint::from("c")],
            corrupt: vec![Fingerprint::from("d")],
            errors: 1,
        };
        assert_eq!(report.removed(), 4);
    }
}
