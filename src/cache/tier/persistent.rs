//! Disk-backed tier of record
//!
//! One JSON document per fingerprint under `<base_dir>/entries/`. Writes go
//! to a temporary file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use crate::cache::entry::CacheEntry;
use crate::cache::tier::{SweepPolicy, SweepReport, TierStore};
use crate::cache::types::{Fingerprint, Payload, Priority, TierKind};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable row: everything except the similarity working set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentRecord {
    pub fingerprint: Fingerprint,
    pub tenant: String,
    pub category: String,
    pub payload: Payload,
    pub confidence: f64,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Absolute tier expiry
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
}

impl PersistentRecord {
    pub fn from_entry(entry: &CacheEntry, ttl: Duration) -> Self {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(30));

        Self {
            fingerprint: entry.fingerprint.clone(),
            tenant: entry.tenant.clone(),
            category: entry.category.clone(),
            payload: entry.payload.clone(),
            confidence: entry.confidence,
            usage_count: entry.usage_count,
            created_at: entry.created_at,
            last_used_at: entry.last_used_at,
            expires_at,
            priority: entry.priority,
        }
    }

    /// Entry with an empty working set; the caller rehydrates it from the query
    pub fn into_entry(self) -> CacheEntry {
        CacheEntry {
            fingerprint: self.fingerprint,
            tenant: self.tenant,
            category: self.category,
            normalized_text: String::new(),
            token_set: Default::default(),
            payload: self.payload,
            confidence: self.confidence,
            usage_count: self.usage_count,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            expires_at: Some(self.expires_at),
            priority: self.priority,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// File-per-entry persistent tier
pub struct FileTier {
    entries_dir: PathBuf,
    // Serializes read-modify-write sequences on records
    write_lock: Mutex<()>,
}

impl FileTier {
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let entries_dir = base_dir.into().join("entries");
        fs::create_dir_all(&entries_dir).await?;
        info!("Persistent tier at {:?}", entries_dir);

        Ok(Self {
            entries_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Only hex fingerprints map to files
    fn path_for(&self, key: &Fingerprint) -> Option<PathBuf> {
        let s = key.as_str();
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.entries_dir.join(format!("{}.json", s)))
    }

    async fn read_record(&self, key: &Fingerprint, path: &Path) -> Result<Option<PersistentRecord>> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::CorruptEntry {
                tier: TierKind::Persistent,
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    async fn write_record(&self, path: &Path, record: &PersistentRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every `*.json` record path currently on disk
    async fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let mut dir = fs::read_dir(&self.entries_dir).await?;
        let mut paths = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn key_of(path: &Path) -> Fingerprint {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        Fingerprint::from(stem)
    }
}

#[async_trait]
impl TierStore for FileTier {
    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let Some(path) = self.path_for(key) else {
            return Ok(None);
        };

        match self.read_record(key, &path).await? {
            Some(record) if !record.is_expired_at(Utc::now()) => Ok(Some(record.into_entry())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let path = self.path_for(key).ok_or_else(|| {
            CacheError::Validation(format!("fingerprint {} is not a valid record key", key))
        })?;
        let mut record = PersistentRecord::from_entry(entry, ttl);

        let _guard = self.write_lock.lock().await;
        // Usage history survives a rewrite; an expired or unreadable record has none
        if let Ok(Some(previous)) = self.read_record(key, &path).await {
            if !previous.is_expired_at(Utc::now()) {
                record.usage_count = record.usage_count.max(previous.usage_count);
                record.created_at = record.created_at.min(previous.created_at);
                record.last_used_at = record.last_used_at.max(previous.last_used_at);
            }
        }
        self.write_record(&path, &record).await?;
        debug!("Persisted entry {}", key);
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        let Some(path) = self.path_for(key) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        Self::remove(&path).await
    }

    async fn touch(
        &self,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(path) = self.path_for(key) else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.read_record(key, &path).await? else {
            return Ok(());
        };
        record.usage_count = record.usage_count.max(usage_count);
        record.last_used_at = record.last_used_at.max(last_used_at);
        self.write_record(&path, &record).await
    }

    async fn scan_recent(
        &self,
        tenant: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let now = Utc::now();
        let mut records = Vec::new();

        for path in self.record_paths().await? {
            let key = Self::key_of(&path);
            match self.read_record(&key, &path).await {
                Ok(Some(record))
                    if record.tenant == tenant
                        && record.category == category
                        && !record.is_expired_at(now) =>
                {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e @ CacheError::CorruptEntry { .. }) => {
                    warn!("Removing unreadable record {:?}: {}", path, e);
                    let _guard = self.write_lock.lock().await;
                    Self::remove(&path).await.ok();
                }
                Err(e) => debug!("Skipping unreadable record {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(records
            .into_iter()
            .take(limit)
            .map(PersistentRecord::into_entry)
            .collect())
    }

    async fn sweep_expired(&self, policy: &SweepPolicy) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for path in self.record_paths().await? {
            let key = Self::key_of(&path);
            let record = match self.read_record(&key, &path).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e @ CacheError::CorruptEntry { .. }) => {
                    warn!("Sweep removing {:?}: {}", path, e);
                    let _guard = self.write_lock.lock().await;
                    match Self::remove(&path).await {
                        Ok(true) => report.corrupt.push(key),
                        Ok(false) => {}
                        Err(e) => {
                            warn!("Sweep failed to remove {:?}: {}", path, e);
                            report.errors += 1;
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Sweep skipping {:?}: {}", path, e);
                    report.errors += 1;
                    continue;
                }
            };

            let expired = record.is_expired_at(policy.now);
            let stale = !expired
                && policy.is_stale(record.usage_count, record.confidence, record.created_at);
            if !expired && !stale {
                continue;
            }

            let _guard = self.write_lock.lock().await;
            match Self::remove(&path).await {
                Ok(true) if expired => report.expired.push(key),
                Ok(true) => report.purged.push(key),
                Ok(false) => {}
                Err(e) => {
                    warn!("Sweep failed to remove {:?}: {}", path, e);
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintIndex;
    use crate::cache::normalize::Normalizer;

    fn entry(text: &str) -> CacheEntry {
        let normalized = Normalizer::default().normalize(text);
        let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, "acme");
        CacheEntry::new(fp, "acme", "billing", &normalized, Payload::from("answer"), 0.9)
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[tokio::test]
    async fn test_set_get_drops_working_set() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();
        let e = entry("refund policy");

        tier.set(&e.fingerprint, &e, DAY).await.unwrap();
        let got = tier.get(&e.fingerprint).await.unwrap().unwrap();

        assert_eq!(got.payload, e.payload);
        assert_eq!(got.usage_count, 1);
        assert!(got.normalized_text.is_empty());
        assert!(got.token_set.is_empty());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry("refund policy");
        {
            let tier = FileTier::open(dir.path()).await.unwrap();
            tier.set(&e.fingerprint, &e, DAY).await.unwrap();
        }
        let tier = FileTier::open(dir.path()).await.unwrap();
        assert!(tier.get(&e.fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_record_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();
        let e = entry("refund policy");
        let path = tier.path_for(&e.fingerprint).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        assert!(matches!(
            tier.get(&e.fingerprint).await,
            Err(CacheError::CorruptEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_hex_key_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();
        let key = Fingerprint::from("../escape");
        assert!(tier.get(&key).await.unwrap().is_none());
        assert!(!tier.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_corrupt_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();

        let short = entry("refund policy");
        let long = entry("shipping times");
        tier.set(&short.fingerprint, &short, Duration::from_millis(10)).await.unwrap();
        tier.set(&long.fingerprint, &long, DAY).await.unwrap();
        let garbage = dir.path().join("entries").join("abcdef.json");
        std::fs::write(&garbage, "{").unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = tier
            .sweep_expired(&SweepPolicy::new(Utc::now()))
            .await
            .unwrap();

        assert_eq!(report.expired, vec![short.fingerprint.clone()]);
        assert_eq!(report.corrupt, vec![Fingerprint::from("abcdef")]);
        assert_eq!(report.errors, 0);
        assert!(!garbage.exists());
        assert!(tier.get(&long.fingerprint).await.unwrap().is_some());

        // a second pass has nothing left to trip over
        let again = tier
            .sweep_expired(&SweepPolicy::new(Utc::now()))
            .await
            .unwrap();
        assert_eq!(again.removed(), 0);
    }

    #[tokio::test]
    async fn test_sweep_purges_low_quality() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();

        let mut stale = entry("refund policy");
        stale.confidence = 0.75;
        stale.created_at = Utc::now() - chrono::Duration::days(10);
        let mut used = entry("shipping times");
        used.confidence = 0.75;
        used.usage_count = 3;
        used.created_at = Utc::now() - chrono::Duration::days(10);

        tier.set(&stale.fingerprint, &stale, DAY).await.unwrap();
        tier.set(&used.fingerprint, &used, DAY).await.unwrap();

        let policy = SweepPolicy::new(Utc::now()).with_stale_purge(chrono::Duration::days(7), 0.8);
        let report = tier.sweep_expired(&policy).await.unwrap();

        assert_eq!(report.purged, vec![stale.fingerprint.clone()]);
        assert!(report.expired.is_empty());
        assert!(tier.get(&used.fingerprint).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_touch_and_scan_recent() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();
        let a = entry("refund policy");
        let b = entry("shipping times");
        tier.set(&a.fingerprint, &a, DAY).await.unwrap();
        tier.set(&b.fingerprint, &b, DAY).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        tier.touch(&a.fingerprint, 9, later).await.unwrap();

        let recent = tier.scan_recent("acme", "billing", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].fingerprint, a.fingerprint);
        assert_eq!(recent[0].usage_count, 9);

        assert!(tier.scan_recent("globex", "billing", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_keeps_usage_history() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();

        let mut first = entry("refund policy");
        first.usage_count = 6;
        first.created_at = Utc::now() - chrono::Duration::hours(3);
        tier.set(&first.fingerprint, &first, DAY).await.unwrap();

        let fresh = entry("refund policy");
        assert_eq!(fresh.usage_count, 1);
        tier.set(&fresh.fingerprint, &fresh, DAY).await.unwrap();

        let got = tier.get(&fresh.fingerprint).await.unwrap().unwrap();
        assert_eq!(got.usage_count, 6);
        assert_eq!(got.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_scan_recent_removes_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let tier = FileTier::open(dir.path()).await.unwrap();
        let e = entry("refund policy");
        tier.set(&e.fingerprint, &e, DAY).await.unwrap();
        let garbage = dir.path().join("entries").join("abcdef.json");
        std::fs::write(&garbage, "garbage").unwrap();

        let recent = tier.scan_recent("acme", "billing", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(!garbage.exists());
    }
}
