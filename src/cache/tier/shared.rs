//! Out-of-process tier shared by cache instances
//!
//! Any store offering `GET`, `SET .. EX`, `DEL` and a scored recency index
//! can back this tier through [`KeyValueBackend`]. Entries are stored as JSON
//! together with their tier expiry.

use crate::cache::entry::CacheEntry;
use crate::cache::tier::{SweepPolicy, SweepReport, TierStore};
use crate::cache::types::{Fingerprint, TierKind};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ENTRY_PREFIX: &str = "qcache:entry:";
const INDEX_PREFIX: &str = "qcache:recent:";

/// Minimal key-value contract for the shared tier
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Add or rescore `member` in a recency index, refreshing the index lifetime
    async fn index_add(&self, index: &str, member: &str, score: f64, ttl: Duration) -> Result<()>;

    async fn index_remove(&self, index: &str, member: &str) -> Result<()>;

    /// Highest-scored members first
    async fn index_recent(&self, index: &str, limit: usize) -> Result<Vec<String>>;

    /// Drop expired keys and return them. Backends with native expiry return
    /// nothing.
    async fn purge_expired(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedRecord {
    expires_at: DateTime<Utc>,
    entry: CacheEntry,
}

/// Shared tier over any [`KeyValueBackend`]
pub struct SharedTier {
    backend: Arc<dyn KeyValueBackend>,
}

impl SharedTier {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        info!("Shared tier using {} backend", backend.name());
        Self { backend }
    }

    fn entry_key(key: &Fingerprint) -> String {
        format!("{}{}", ENTRY_PREFIX, key)
    }

    /// Tenant is length-prefixed so that tenant/category pairs cannot collide
    fn index_key(tenant: &str, category: &str) -> String {
        format!("{}{}:{}:{}", INDEX_PREFIX, tenant.len(), tenant, category)
    }

    fn decode(key: &Fingerprint, raw: &str) -> Result<SharedRecord> {
        serde_json::from_str(raw).map_err(|e| CacheError::CorruptEntry {
            tier: TierKind::Shared,
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    async fn write(&self, record: &SharedRecord, ttl: Duration) -> Result<()> {
        let entry = &record.entry;
        let raw = serde_json::to_string(record)?;
        self.backend
            .set_ex(&Self::entry_key(&entry.fingerprint), &raw, ttl)
            .await?;
        self.backend
            .index_add(
                &Self::index_key(&entry.tenant, &entry.category),
                entry.fingerprint.as_str(),
                entry.last_used_at.timestamp_millis() as f64,
                ttl,
            )
            .await
    }
}

#[async_trait]
impl TierStore for SharedTier {
    fn kind(&self) -> TierKind {
        TierKind::Shared
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let Some(raw) = self.backend.get(&Self::entry_key(key)).await? else {
            return Ok(None);
        };
        let record = Self::decode(key, &raw)?;
        if record.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(record.entry))
    }

    async fn set(&self, _key: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let record = SharedRecord {
            expires_at,
            entry: entry.clone(),
        };
        self.write(&record, ttl).await
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        let entry_key = Self::entry_key(key);
        if let Some(raw) = self.backend.get(&entry_key).await? {
            if let Ok(record) = Self::decode(key, &raw) {
                let index = Self::index_key(&record.entry.tenant, &record.entry.category);
                self.backend.index_remove(&index, key.as_str()).await?;
            }
        }
        self.backend.del(&entry_key).await
    }

    async fn touch(
        &self,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(raw) = self.backend.get(&Self::entry_key(key)).await? else {
            return Ok(());
        };
        let mut record = Self::decode(key, &raw)?;
        let Ok(remaining) = (record.expires_at - Utc::now()).to_std() else {
            return Ok(());
        };

        record.entry.usage_count = record.entry.usage_count.max(usage_count);
        record.entry.last_used_at = record.entry.last_used_at.max(last_used_at);
        self.write(&record, remaining).await
    }

    async fn scan_recent(
        &self,
        tenant: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let index = Self::index_key(tenant, category);
        let members = self.backend.index_recent(&index, limit).await?;
        let now = Utc::now();

        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let key = Fingerprint::from(member.as_str());
            match self.backend.get(&Self::entry_key(&key)).await? {
                None => {
                    // Entry expired natively; drop the dangling index member
                    self.backend.index_remove(&index, &member).await?;
                }
                Some(raw) => match Self::decode(&key, &raw) {
                    Ok(record) if record.expires_at > now => entries.push(record.entry),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Removing unreadable shared candidate: {}", e);
                        self.backend.index_remove(&index, &member).await?;
                        self.backend.del(&Self::entry_key(&key)).await?;
                    }
                },
            }
        }

        Ok(entries)
    }

    async fn sweep_expired(&self, _policy: &SweepPolicy) -> Result<SweepReport> {
        let purged = self.backend.purge_expired().await?;
        let expired = purged
            .iter()
            .filter_map(|k| k.strip_prefix(ENTRY_PREFIX))
            .map(Fingerprint::from)
            .collect();

        Ok(SweepReport {
            expired,
            ..Default::default()
        })
    }
}

#[derive(Default)]
struct KvState {
    values: HashMap<String, (String, DateTime<Utc>)>,
    indexes: HashMap<String, HashMap<String, f64>>,
}

/// Single-process stand-in for a remote key-value store
#[derive(Default)]
pub struct InProcessKv {
    state: RwLock<KvState>,
}

impl InProcessKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a raw value; used to simulate foreign or damaged writes
    pub async fn put_raw(&self, key: &str, value: &str, ttl: Duration) {
        // In-process writes cannot fail
        let _ = self.set_ex(key, value, ttl).await;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueBackend for InProcessKv {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state
            .values
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut state = self.state.write().await;
        state
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.values.remove(key).is_some())
    }

    async fn index_add(&self, index: &str, member: &str, score: f64, _ttl: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(members) = state.indexes.get_mut(index) {
            members.remove(member);
            if members.is_empty() {
                state.indexes.remove(index);
            }
        }
        Ok(())
    }

    async fn index_recent(&self, index: &str, limit: usize) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(members) = state.indexes.get(index) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(&String, f64)> = members.iter().map(|(m, s)| (m, *s)).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let expired: Vec<String> = state
            .values
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            state.values.remove(key);
        }

        Ok(expired)
    }
}

/// Redis-backed shared store
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to a Redis URL such as `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::ConfigError(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::unavailable(TierKind::Shared, e.to_string()))?;

        info!("Connected to Redis shared tier");
        Ok(Self { conn })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // EX has second granularity; round up so short TTLs still apply
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        secs.max(1)
    }
}

#[async_trait]
impl KeyValueBackend for RedisKv {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn index_add(&self, index: &str, member: &str, score: f64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("ZADD")
            .arg(index)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("EXPIRE")
            .arg(index)
            .arg(Self::ttl_secs(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(index)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn index_recent(&self, index: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let members = redis::cmd("ZREVRANGE")
            .arg(index)
            .arg(0)
            .arg(limit as isize - 1)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?;
        debug!("Fetched {} recency members from {}", members.len(), index);
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintIndex;
    use crate::cache::normalize::Normalizer;
    use crate::cache::types::Payload;

    fn entry(text: &str, tenant: &str) -> CacheEntry {
        let normalized = Normalizer::default().normalize(text);
        let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, tenant);
        CacheEntry::new(fp, tenant, "billing", &normalized, Payload::from("answer"), 0.9)
    }

    fn tier() -> (Arc<InProcessKv>, SharedTier) {
        let kv = Arc::new(InProcessKv::new());
        let tier = SharedTier::new(kv.clone());
        (kv, tier)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_set_get_roundtrip_keeps_working_set() {
        let (_, tier) = tier();
        let e = entry("refund policy", "acme");
        tier.set(&e.fingerprint, &e, HOUR).await.unwrap();

        let got = tier.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.token_set, e.token_set);
        assert_eq!(got.normalized_text, "refund policy");
    }

    #[tokio::test]
    async fn test_delete_removes_entry_and_index() {
        let (_, tier) = tier();
        let e = entry("refund policy", "acme");
        tier.set(&e.fingerprint, &e, HOUR).await.unwrap();

        assert!(tier.delete(&e.fingerprint).await.unwrap());
        assert!(!tier.delete(&e.fingerprint).await.unwrap());
        assert!(tier.scan_recent("acme", "billing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_entry_reported() {
        let (kv, tier) = tier();
        let key = Fingerprint::from("deadbeef");
        kv.put_raw(&SharedTier::entry_key(&key), "{not json", HOUR).await;

        match tier.get(&key).await {
            Err(CacheError::CorruptEntry { tier, .. }) => assert_eq!(tier, TierKind::Shared),
            other => panic!("expected corrupt entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scan_recent_scoped_by_tenant() {
        let (_, tier) = tier();
        let a = entry("refund policy", "acme");
        let b = entry("refund policy", "globex");
        tier.set(&a.fingerprint, &a, HOUR).await.unwrap();
        tier.set(&b.fingerprint, &b, HOUR).await.unwrap();

        let acme = tier.scan_recent("acme", "billing", 10).await.unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].tenant, "acme");
    }

    #[tokio::test]
    async fn test_expiry_and_purge() {
        let (kv, tier) = tier();
        let e = entry("refund policy", "acme");
        tier.set(&e.fingerprint, &e, Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tier.get(&e.fingerprint).await.unwrap().is_none());
        assert!(tier.scan_recent("acme", "billing", 10).await.unwrap().is_empty());

        let report = tier.sweep_expired(&SweepPolicy::new(Utc::now())).await.unwrap();
        assert_eq!(report.expired, vec![e.fingerprint.clone()]);
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_touch_is_monotonic() {
        let (_, tier) = tier();
        let e = entry("refund policy", "acme");
        tier.set(&e.fingerprint, &e, HOUR).await.unwrap();

        tier.touch(&e.fingerprint, 4, Utc::now()).await.unwrap();
        tier.touch(&e.fingerprint, 2, Utc::now()).await.unwrap();
        let got = tier.get(&e.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.usage_count, 4);

        // missing key is not an error
        tier.touch(&Fingerprint::from("missing"), 1, Utc::now())
            .await
            .unwrap();
    }

    #[test]
    fn test_redis_ttl_rounding() {
        assert_eq!(RedisKv::ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(RedisKv::ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(RedisKv::ttl_secs(Duration::from_secs(60)), 60);
    }

    #[tokio::test]
    async fn test_scan_removes_corrupt_candidate() {
        let (kv, tier) = tier();
        let e = entry("refund policy", "acme");
        tier.set(&e.fingerprint, &e, HOUR).await.unwrap();
        kv.put_raw(&SharedTier::entry_key(&e.fingerprint), "not a record", HOUR)
            .await;

        assert!(tier.scan_recent("acme", "billing", 10).await.unwrap().is_empty());
        assert!(kv.is_empty().await);
        assert!(kv
            .index_recent(&SharedTier::index_key("acme", "billing"), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
