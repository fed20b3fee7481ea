//! Capacity eviction for the memory tier and the periodic TTL sweep
//!
//! [`EvictionHeap`] orders evictable memory entries by `(priority,
//! last_used_at)` and is only ever touched under the memory tier's lock.
//! [`EvictionManager`] owns the background task that expires entries in every
//! tier and releases memory pressure before writes are forced to.

use crate::cache::config::CacheConfig;
use crate::cache::invalidation::{InvalidationEvent, InvalidationReason};
use crate::cache::tier::{SweepPolicy, TierSet};
use crate::cache::types::{Fingerprint, Priority, StatsRecorder, TierKind};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapItem {
    priority: Priority,
    last_used_at: DateTime<Utc>,
    generation: u64,
    key: Fingerprint,
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap (lowest priority, then oldest, first)
        other
            .priority
            .cmp(&self.priority)
            .then(other.last_used_at.cmp(&self.last_used_at))
            .then(other.generation.cmp(&self.generation))
    }
}

/// Min-heap of eviction candidates with lazy deletion.
///
/// Each push carries the slot generation it describes; the owner discards
/// popped items whose generation no longer matches the live slot.
#[derive(Debug, Default)]
pub struct EvictionHeap {
    heap: BinaryHeap<HeapItem>,
}

impl EvictionHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pinned entries are never evictable and are not tracked.
    pub fn push(
        &mut self,
        key: Fingerprint,
        priority: Priority,
        last_used_at: DateTime<Utc>,
        generation: u64,
    ) {
        if priority == Priority::Pinned {
            return;
        }
        self.heap.push(HeapItem {
            priority,
            last_used_at,
            generation,
            key,
        });
    }

    /// Next candidate as `(key, generation)`, possibly stale
    pub fn pop(&mut self) -> Option<(Fingerprint, u64)> {
        self.heap.pop().map(|item| (item.key, item.generation))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Sweep and pressure-release settings
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub interval: Duration,
    pub pressure_threshold: f64,
    pub pressure_target: f64,
    pub stale_entry_age: Duration,
    pub stale_confidence: f64,
}

impl From<&CacheConfig> for EvictionConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            pressure_threshold: config.pressure_threshold,
            pressure_target: config.pressure_target,
            stale_entry_age: config.stale_entry_age,
            stale_confidence: config.stale_confidence,
        }
    }
}

/// Handle for controlling the background sweep task
pub struct SweepHandle {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Signal the task and wait for the in-flight pass to finish
    pub async fn stop(self) {
        // Receiver may already be dropped if the task ended
        self.shutdown_tx.send(()).await.ok();
        if let Err(e) = self.task.await {
            warn!("Sweep task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }
}

/// Runs TTL expiry across all tiers plus memory pressure release
pub struct EvictionManager {
    config: EvictionConfig,
    tiers: Arc<TierSet>,
    stats: Arc<StatsRecorder>,
}

impl EvictionManager {
    pub fn new(config: EvictionConfig, tiers: Arc<TierSet>, stats: Arc<StatsRecorder>) -> Self {
        Self {
            config,
            tiers,
            stats,
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// One full pass. Failures in one tier are logged and do not stop the
    /// pass over the others.
    pub async fn run_once(&self) -> Vec<InvalidationEvent> {
        let stale_age = chrono::Duration::from_std(self.config.stale_entry_age)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let policy = SweepPolicy::new(Utc::now())
            .with_stale_purge(stale_age, self.config.stale_confidence);

        let mut events = Vec::new();

        for kind in self.tiers.kinds() {
            let report = match self.tiers.sweep(kind, &policy, self.config.interval).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("TTL sweep of {} tier failed: {}", kind, e);
                    self.stats.record_tier_error();
                    continue;
                }
            };

            if report.errors > 0 {
                warn!(
                    "TTL sweep of {} tier skipped {} unreadable entries",
                    kind, report.errors
                );
            }

            let removed = report.removed() as u64;
            if removed > 0 {
                self.stats.record_expirations(removed);
                debug!(
                    "Swept {} tier: {} expired, {} purged, {} corrupt",
                    kind,
                    report.expired.len(),
                    report.purged.len(),
                    report.corrupt.len()
                );
            }

            if !report.expired.is_empty() {
                events.push(
                    InvalidationEvent::new(InvalidationReason::Expired, report.expired)
                        .in_tier(kind),
                );
            }
            if !report.purged.is_empty() {
                events.push(
                    InvalidationEvent::new(InvalidationReason::LowQuality, report.purged)
                        .in_tier(kind),
                );
            }
            if !report.corrupt.is_empty() {
                events.push(
                    InvalidationEvent::new(InvalidationReason::Corrupt, report.corrupt)
                        .in_tier(kind),
                );
            }
        }

        for event in &events {
            self.tiers.invalidations().record(event.clone()).await;
        }

        // records its own event
        if let Some(event) = self.release_pressure().await {
            events.push(event);
        }

        events
    }

    /// Evict down to the target occupancy if the threshold is exceeded
    pub async fn release_pressure(&self) -> Option<InvalidationEvent> {
        let memory = self.tiers.memory();
        let occupancy = memory.occupancy().await;
        if occupancy <= self.config.pressure_threshold {
            return None;
        }

        let evicted = memory.release_pressure(self.config.pressure_target).await;
        if evicted.is_empty() {
            return None;
        }

        self.stats.record_evictions(evicted.len() as u64);
        info!(
            "Released memory pressure: evicted {} entries (occupancy was {:.1}%)",
            evicted.len(),
            occupancy * 100.0
        );

        let event = InvalidationEvent::new(InvalidationReason::MemoryPressure, evicted)
            .in_tier(TierKind::Memory);
        self.tiers.invalidations().record(event.clone()).await;
        Some(event)
    }

    /// Spawn the periodic sweep. The first pass runs one interval after start.
    pub fn start(self: &Arc<Self>) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);

        let manager = Arc::clone(self);
        let period = self.config.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("TTL sweep started (interval {:?})", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let events = manager.run_once().await;
                        let removed: usize = events.iter().map(|e| e.keys.len()).sum();
                        if removed > 0 {
                            info!("TTL sweep removed {} entries", removed);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            running_clone.store(false, AtomicOrdering::Relaxed);
            info!("TTL sweep stopped");
        });

        SweepHandle {
            shutdown_tx,
            running,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s)
    }

    #[test]
    fn test_heap_orders_by_priority_then_age() {
        let now = Utc::now();
        let mut heap = EvictionHeap::new();
        heap.push(fp("high-old"), Priority::High, now - chrono::Duration::hours(2), 1);
        heap.push(fp("normal-new"), Priority::Normal, now, 2);
        heap.push(fp("normal-old"), Priority::Normal, now - chrono::Duration::hours(1), 3);
        heap.push(fp("low-new"), Priority::Low, now, 4);

        let order: Vec<String> = std::iter::from_fn(|| heap.pop())
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(order, vec!["low-new", "normal-old", "normal-new", "high-old"]);
    }

    #[test]
    fn test_pinned_entries_not_tracked() {
        let mut heap = EvictionHeap::new();
        heap.push(fp("pinned"), Priority::Pinned, Utc::now(), 1);
        assert!(heap.is_empty());
        assert!(heap.pop().is_none());
    }

    #[test]
    fn test_generation_returned_for_lazy_deletion() {
        let now = Utc::now();
        let mut heap = EvictionHeap::new();
        heap.push(fp("k"), Priority::Normal, now - chrono::Duration::seconds(5), 1);
        heap.push(fp("k"), Priority::Normal, now, 2);
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.pop(), Some((fp("k"), 1)));
        assert_eq!(heap.pop(), Some((fp("k"), 2)));
    }

    #[test]
    fn test_eviction_config_from_cache_config() {
        let config = CacheConfig::default();
        let eviction = EvictionConfig::from(&config);
        assert_eq!(eviction.interval, Duration::from_secs(60));
        assert_eq!(eviction.pressure_threshold, 0.8);
    }
}
