//! In-process tier with a byte budget
//!
//! The entry map, the eviction heap and the used-bytes counter live behind a
//! single mutex so that check-capacity-then-insert is atomic.

use crate::cache::entry::CacheEntry;
use crate::cache::eviction::EvictionHeap;
use crate::cache::tier::{SweepPolicy, SweepReport, TierStore};
use crate::cache::types::{Fingerprint, TierKind};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

struct MemorySlot {
    entry: CacheEntry,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
    generation: u64,
}

impl MemorySlot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at || self.entry.is_expired_at(now)
    }
}

#[derive(Default)]
struct MemoryState {
    slots: HashMap<Fingerprint, MemorySlot>,
    heap: EvictionHeap,
    used_bytes: usize,
    next_generation: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &Fingerprint) -> Option<MemorySlot> {
        let slot = self.slots.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(slot.size_bytes);
        Some(slot)
    }

    fn track(&mut self, key: &Fingerprint) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.generation = generation;
            self.heap.push(
                key.clone(),
                slot.entry.priority,
                slot.entry.last_used_at,
                generation,
            );
        }
        self.maybe_compact();
    }

    /// Evict the lowest-priority, least recently used entry
    fn evict_one(&mut self) -> Option<Fingerprint> {
        while let Some((key, generation)) = self.heap.pop() {
            let live = self
                .slots
                .get(&key)
                .map(|slot| slot.generation == generation)
                .unwrap_or(false);
            if live {
                self.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Drop stale heap items once they dominate the heap
    fn maybe_compact(&mut self) {
        if self.heap.len() <= self.slots.len() * 4 + 64 {
            return;
        }
        self.heap.clear();
        for (key, slot) in &self.slots {
            self.heap.push(
                key.clone(),
                slot.entry.priority,
                slot.entry.last_used_at,
                slot.generation,
            );
        }
    }
}

/// Fastest, smallest tier; entries are kept as in-process objects
pub struct MemoryTier {
    budget_bytes: usize,
    state: Mutex<MemoryState>,
}

impl MemoryTier {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Insert, evicting as needed. Returns the evicted keys.
    ///
    /// An entry larger than the whole budget, or one that cannot fit because
    /// only pinned entries remain, is refused.
    pub async fn insert(&self, entry: CacheEntry, ttl: Duration) -> Result<Vec<Fingerprint>> {
        let size_bytes = entry.size_bytes();
        if size_bytes > self.budget_bytes {
            return Err(CacheError::unavailable(
                TierKind::Memory,
                format!(
                    "entry of {} bytes exceeds memory budget of {} bytes",
                    size_bytes, self.budget_bytes
                ),
            ));
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let key = entry.fingerprint.clone();

        let mut state = self.state.lock().await;
        state.remove(&key);

        let mut evicted = Vec::new();
        while state.used_bytes + size_bytes > self.budget_bytes {
            match state.evict_one() {
                Some(victim) => evicted.push(victim),
                None => {
                    return Err(CacheError::unavailable(
                        TierKind::Memory,
                        "memory budget exhausted by pinned entries",
                    ))
                }
            }
        }

        state.used_bytes += size_bytes;
        state.slots.insert(
            key.clone(),
            MemorySlot {
                entry,
                expires_at,
                size_bytes,
                generation: 0,
            },
        );
        state.track(&key);

        Ok(evicted)
    }

    /// Evict until occupancy is at or below `target` (fraction of budget)
    pub async fn release_pressure(&self, target: f64) -> Vec<Fingerprint> {
        let target_bytes = (self.budget_bytes as f64 * target) as usize;
        let mut state = self.state.lock().await;

        let mut evicted = Vec::new();
        while state.used_bytes > target_bytes {
            match state.evict_one() {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        evicted
    }

    /// Used bytes as a fraction of the budget
    pub async fn occupancy(&self) -> f64 {
        let state = self.state.lock().await;
        if self.budget_bytes == 0 {
            return 0.0;
        }
        state.used_bytes as f64 / self.budget_bytes as f64
    }

    /// `(used_bytes, entries)`
    pub async fn usage(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.used_bytes, state.slots.len())
    }

    /// Live entries with the highest usage counts
    pub async fn top_entries(&self, limit: usize) -> Vec<CacheEntry> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut entries: Vec<&CacheEntry> = state
            .slots
            .values()
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| &slot.entry)
            .collect();
        entries.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then(b.last_used_at.cmp(&a.last_used_at))
        });
        entries.into_iter().take(limit).cloned().collect()
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired = match state.slots.get(key) {
            None => return Ok(None),
            Some(slot) => slot.is_expired(now),
        };

        if expired {
            debug!("Memory entry expired on read: {}", key);
            state.remove(key);
            return Ok(None);
        }

        Ok(state.slots.get(key).map(|slot| slot.entry.clone()))
    }

    async fn set(&self, _key: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        self.insert(entry.clone(), ttl).await.map(|_| ())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.remove(key).is_some())
    }

    async fn touch(
        &self,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots.get_mut(key) else {
            return Ok(());
        };
        slot.entry.usage_count = slot.entry.usage_count.max(usage_count);
        slot.entry.last_used_at = slot.entry.last_used_at.max(last_used_at);
        state.track(key);
        Ok(())
    }

    async fn scan_recent(
        &self,
        tenant: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let now = Utc::now();
        let state = self.state.lock().await;

        let mut matches: Vec<&CacheEntry> = state
            .slots
            .values()
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| &slot.entry)
            .filter(|e| e.tenant == tenant && e.category == category)
            .collect();
        matches.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));

        Ok(matches.into_iter().take(limit).cloned().collect())
    }

    async fn sweep_expired(&self, policy: &SweepPolicy) -> Result<SweepReport> {
        let mut state = self.state.lock().await;

        let expired: Vec<Fingerprint> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_expired(policy.now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }

        Ok(SweepReport {
            expired,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintIndex;
    use crate::cache::normalize::Normalizer;
    use crate::cache::types::{Payload, Priority};

    fn entry(text: &str, payload_len: usize) -> CacheEntry {
        let normalized = Normalizer::default().normalize(text);
        let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, "t");
        CacheEntry::new(
            fp,
            "t",
            "c",
            &normalized,
            Payload::from("x".repeat(payload_len)),
            0.9,
        )
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_insert_get_delete() {
        let tier = MemoryTier::new(1024 * 1024);
        let e = entry("refund policy", 10);
        tier.insert(e.clone(), HOUR).await.unwrap();

        let got = tier.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.payload, e.payload);

        assert!(tier.delete(&e.fingerprint).await.unwrap());
        assert!(!tier.delete(&e.fingerprint).await.unwrap());
        assert!(tier.get(&e.fingerprint).await.unwrap().is_none());
        assert_eq!(tier.usage().await, (0, 0));
    }

    #[tokio::test]
    async fn test_budget_enforced_with_eviction() {
        let size = entry("alpha", 1000).size_bytes();
        let tier = MemoryTier::new(size * 3);

        let mut evicted_total = 0;
        for word in ["alpha", "bravo", "charlie", "delta", "echo"] {
            evicted_total += tier.insert(entry(word, 1000), HOUR).await.unwrap().len();
            let (used, _) = tier.usage().await;
            assert!(used <= tier.budget_bytes());
        }
        assert!(evicted_total >= 2);
    }

    #[tokio::test]
    async fn test_eviction_prefers_low_priority_then_oldest() {
        let size = entry("alpha", 100).size_bytes();
        let tier = MemoryTier::new(size * 2 + size / 2);

        let high = entry("alpha", 100).with_priority(Priority::High);
        let low = entry("bravo", 100).with_priority(Priority::Low);
        tier.insert(high.clone(), HOUR).await.unwrap();
        tier.insert(low.clone(), HOUR).await.unwrap();

        let evicted = tier.insert(entry("charlie", 100), HOUR).await.unwrap();
        assert_eq!(evicted, vec![low.fingerprint.clone()]);
        assert!(tier.get(&high.fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_touch_protects_recently_used() {
        let size = entry("alpha", 100).size_bytes();
        let tier = MemoryTier::new(size * 2 + size / 2);

        let first = entry("alpha", 100);
        let second = entry("bravo", 100);
        tier.insert(first.clone(), HOUR).await.unwrap();
        tier.insert(second.clone(), HOUR).await.unwrap();

        tier.touch(&first.fingerprint, 5, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let evicted = tier.insert(entry("charlie", 100), HOUR).await.unwrap();
        assert_eq!(evicted, vec![second.fingerprint.clone()]);
        let kept = tier.get(&first.fingerprint).await.unwrap().unwrap();
        assert_eq!(kept.usage_count, 5);
    }

    #[tokio::test]
    async fn test_pinned_never_evicted() {
        let size = entry("alpha", 100).size_bytes();
        let tier = MemoryTier::new(size + size / 2);

        let pinned = entry("alpha", 100).with_priority(Priority::Pinned);
        tier.insert(pinned.clone(), HOUR).await.unwrap();

        assert!(tier.insert(entry("bravo", 100), HOUR).await.is_err());
        assert!(tier.get(&pinned.fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let tier = MemoryTier::new(64);
        assert!(tier.insert(entry("alpha", 1000), HOUR).await.is_err());
        assert_eq!(tier.usage().await, (0, 0));
    }

    #[tokio::test]
    async fn test_expired_on_read_and_sweep() {
        let tier = MemoryTier::new(1024 * 1024);
        let short = entry("alpha", 10);
        let long = entry("bravo", 10);
        tier.insert(short.clone(), Duration::from_millis(50)).await.unwrap();
        tier.insert(long.clone(), HOUR).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(tier.get(&short.fingerprint).await.unwrap().is_none());

        tier.insert(short.clone(), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = tier.sweep_expired(&SweepPolicy::new(Utc::now())).await.unwrap();
        assert_eq!(report.expired, vec![short.fingerprint.clone()]);
        assert_eq!(tier.usage().await.1, 1);
    }

    #[tokio::test]
    async fn test_release_pressure() {
        let size = entry("alpha", 100).size_bytes();
        let tier = MemoryTier::new(size * 10);
        for i in 0..9 {
            tier.insert(entry(&format!("word{}", i), 100), HOUR).await.unwrap();
        }
        assert!(tier.occupancy().await > 0.8);

        let evicted = tier.release_pressure(0.5).await;
        assert!(!evicted.is_empty());
        assert!(tier.occupancy().await <= 0.5);
    }

    #[tokio::test]
    async fn test_scan_recent_scoped_and_ordered() {
        let tier = MemoryTier::new(1024 * 1024);
        let older = entry("alpha", 10);
        let mut newer = entry("bravo", 10);
        newer.last_used_at = older.last_used_at + chrono::Duration::seconds(5);
        let normalized = Normalizer::default().normalize("alpha");
        let other_tenant = CacheEntry::new(
            FingerprintIndex::new().fingerprint(&normalized.canonical, "other"),
            "other",
            "c",
            &normalized,
            Payload::from("y"),
            0.9,
        );

        tier.insert(older.clone(), HOUR).await.unwrap();
        tier.insert(newer.clone(), HOUR).await.unwrap();
        tier.insert(other_tenant, HOUR).await.unwrap();

        let recent = tier.scan_recent("t", "c", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fingerprint, newer.fingerprint);

        assert_eq!(tier.scan_recent("t", "c", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replacing_entry_keeps_accounting() {
        let tier = MemoryTier::new(1024 * 1024);
        let e = entry("alpha", 100);
        tier.insert(e.clone(), HOUR).await.unwrap();
        tier.insert(e.clone(), HOUR).await.unwrap();
        let (used, count) = tier.usage().await;
        assert_eq!(count, 1);
        assert_eq!(used, e.size_bytes());
    }
}
