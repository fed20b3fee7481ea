//! Records of why entries left the cache
//!
//! Explicit invalidation, TTL expiry, the low-quality purge, capacity
//! eviction, pressure release and corrupt entries dropped by a read or a
//! sweep each produce an [`InvalidationEvent`], kept in a bounded
//! [`InvalidationLog`].

use crate::cache::types::{Fingerprint, TierKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

/// Events retained by [`InvalidationLog::default`]
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Reason for cache invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry expired based on TTL
    Expired,

    /// Caller invalidated the fingerprint
    Manual,

    /// Single-use, low-confidence entry aged out
    LowQuality,

    /// Evicted to stay within the memory budget
    SizeLimit,

    /// Proactively evicted by the sweep's pressure release
    MemoryPressure,

    /// Stored entry could not be decoded
    Corrupt,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::LowQuality => write!(f, "low-quality purge"),
            InvalidationReason::SizeLimit => write!(f, "cache size limit reached"),
            InvalidationReason::MemoryPressure => write!(f, "memory pressure release"),
            InvalidationReason::Corrupt => write!(f, "corrupt entry"),
        }
    }
}

/// Invalidation event for tracking and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Tier the keys were removed from; `None` means every tier
    pub tier: Option<TierKind>,

    /// Keys that were invalidated
    pub keys: Vec<Fingerprint>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, keys: Vec<Fingerprint>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            tier: None,
            keys,
            context: None,
        }
    }

    pub fn in_tier(mut self, tier: TierKind) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Add context to the event
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Most recent invalidation events, oldest dropped first
#[derive(Debug)]
pub struct InvalidationLog {
    capacity: usize,
    events: Mutex<VecDeque<InvalidationEvent>>,
}

impl InvalidationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an event; empty events are ignored
    pub async fn record(&self, event: InvalidationEvent) {
        if event.is_empty() || self.capacity == 0 {
            return;
        }
        debug!(
            "Invalidation ({}): {} keys in {}",
            event.reason,
            event.keys.len(),
            event
                .tier
                .map(|t| t.to_string())
                .unwrap_or_else(|| "all tiers".to_string())
        );

        let mut events = self.events.lock().await;
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Up to `limit` events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<InvalidationEvent> {
        self.events
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl Default for InvalidationLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
