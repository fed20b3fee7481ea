//! Cache entry with usage bookkeeping and optional absolute expiry

use crate::cache::normalize::NormalizedQuery;
use crate::cache::types::{Fingerprint, Payload, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// The unit of storage.
///
/// `normalized_text` and `token_set` only live in the memory and shared tiers;
/// the persistent tier drops them and they are rebuilt from the query on a hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,

    pub tenant: String,

    /// Coarse classification tag scoping similarity and clustering
    pub category: String,

    #[serde(default)]
    pub normalized_text: String,

    #[serde(default)]
    pub token_set: BTreeSet<String>,

    pub payload: Payload,

    /// Caller-supplied score in [0, 1]
    pub confidence: f64,

    /// Monotonic, never decremented
    pub usage_count: u64,

    pub created_at: DateTime<Utc>,

    pub last_used_at: DateTime<Utc>,

    /// Absolute expiry; `None` means the tier default lifetime applies
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub priority: Priority,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        tenant: impl Into<String>,
        category: impl Into<String>,
        normalized: &NormalizedQuery,
        payload: Payload,
        confidence: f64,
    ) -> Self {
        let now = Utc::now();

        Self {
            fingerprint,
            tenant: tenant.into(),
            category: category.into(),
            normalized_text: normalized.canonical.clone(),
            token_set: normalized.tokens.clone(),
            payload,
            confidence,
            usage_count: 1,
            created_at: now,
            last_used_at: now,
            expires_at: None,
            priority: Priority::default(),
        }
    }

    /// Expire `ttl` after creation
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|d| self.created_at + d);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Lifetime for a tier: the tier default, capped by the entry's own expiry.
    /// Returns `None` when the entry has already expired.
    pub fn tier_ttl(&self, tier_default: Duration) -> Option<Duration> {
        match self.expires_at {
            None => Some(tier_default),
            Some(at) => {
                let remaining = (at - Utc::now()).to_std().ok()?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(remaining.min(tier_default))
                }
            }
        }
    }

    /// Record a hit
    pub fn mark_used(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Utc::now();
    }

    /// Fill in the similarity working set after a persistent-tier read
    pub fn rehydrate(&mut self, normalized: &NormalizedQuery) {
        if self.normalized_text.is_empty() {
            self.normalized_text = normalized.canonical.clone();
            self.token_set = normalized.tokens.clone();
        }
    }

    /// Carry history over from a previous version of the same fingerprint
    pub fn inherit(&mut self, previous: &CacheEntry) {
        self.usage_count = self.usage_count.max(previous.usage_count);
        self.created_at = self.created_at.min(previous.created_at);
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Approximate heap footprint used for the memory budget
    pub fn size_bytes(&self) -> usize {
        self.fingerprint.as_str().len()
            + self.tenant.len()
            + self.category.len()
            + self.normalized_text.len()
            + self.token_set.iter().map(|t| t.len()).sum::<usize>()
            + self.payload.size_bytes()
            + std::mem::size_of::<CacheEntry>()
    }
}
