//! Curated knowledge patterns checked before the tiered cache
//!
//! Entries are either curated (seeded by hand, never removed by the learner)
//! or learned (written when a pattern cluster is promoted, retracted when it
//! is demoted). Mutation is crate-private; the pattern learner is the only
//! writer. The store is small, never evicted by capacity pressure, and can be
//! exported to JSON for review.

use crate::cache::normalize::NormalizedQuery;
use crate::cache::similarity::jaccard;
use crate::cache::types::Payload;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const REGEX_WEIGHT: f64 = 0.40;
const COVERAGE_WEIGHT: f64 = 0.35;
const JACCARD_WEIGHT: f64 = 0.25;

/// Keywords folded into a learned pattern
pub const MAX_PATTERN_KEYWORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeOrigin {
    /// Authored by a person
    Curated,
    /// Promoted from a pattern cluster
    Learned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub tenant: String,
    pub category: String,

    /// Regex source matched against the canonical query text
    pub pattern: String,

    /// Keywords in pattern order
    pub keywords: Vec<String>,

    pub answer: Payload,
    pub confidence: f64,
    pub origin: KnowledgeOrigin,
    pub created_at: DateTime<Utc>,

    #[serde(skip)]
    regex: Option<Regex>,
}

impl KnowledgeEntry {
    pub fn new(
        tenant: impl Into<String>,
        category: impl Into<String>,
        pattern: impl Into<String>,
        keywords: Vec<String>,
        answer: Payload,
        confidence: f64,
        origin: KnowledgeOrigin,
    ) -> Result<Self> {
        let mut entry = Self {
            id: Uuid::new_v4(),
            tenant: tenant.into(),
            category: category.into(),
            pattern: pattern.into(),
            keywords,
            answer,
            confidence,
            origin,
            created_at: Utc::now(),
            regex: None,
        };
        entry.compile()?;
        Ok(entry)
    }

    /// `k1.*k2.*k3` over escaped keywords, in the given order
    pub fn pattern_for(keywords: &[String]) -> String {
        keywords
            .iter()
            .map(|k| regex::escape(k))
            .collect::<Vec<_>>()
            .join(".*")
    }

    fn compile(&mut self) -> Result<()> {
        let regex = Regex::new(&self.pattern).map_err(|e| {
            CacheError::Validation(format!("invalid knowledge pattern {:?}: {}", self.pattern, e))
        })?;
        self.regex = Some(regex);
        Ok(())
    }

    /// Weighted match score in [0, 1]
    pub fn score(&self, query: &NormalizedQuery) -> f64 {
        if query.is_empty() || self.keywords.is_empty() {
            return 0.0;
        }

        let regex_hit = self
            .regex
            .as_ref()
            .map(|r| r.is_match(&query.canonical))
            .unwrap_or(false);

        let keyword_set: BTreeSet<String> = self.keywords.iter().cloned().collect();
        let covered = keyword_set
            .iter()
            .filter(|k| query.tokens.contains(*k))
            .count();
        let coverage = covered as f64 / keyword_set.len() as f64;

        let regex_score = if regex_hit { 1.0 } else { 0.0 };
        REGEX_WEIGHT * regex_score
            + COVERAGE_WEIGHT * coverage
            + JACCARD_WEIGHT * jaccard(&query.tokens, &keyword_set)
    }
}

/// A knowledge hit
#[derive(Debug, Clone)]
pub struct KnowledgeMatch {
    pub id: Uuid,
    pub answer: Payload,
    pub score: f64,
    pub origin: KnowledgeOrigin,
}

#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeSnapshot {
    exported_at: DateTime<Utc>,
    entries: Vec<KnowledgeEntry>,
}

pub struct KnowledgeStore {
    entries: RwLock<Vec<KnowledgeEntry>>,
    capacity: usize,
    match_threshold: f64,
}

impl KnowledgeStore {
    pub fn new(capacity: usize, match_threshold: f64) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity,
            match_threshold,
        }
    }

    /// Best-scoring entry for this tenant and category at or above the threshold
    pub async fn find(
        &self,
        tenant: &str,
        category: &str,
        query: &NormalizedQuery,
    ) -> Option<KnowledgeMatch> {
        if query.is_empty() {
            return None;
        }

        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.tenant == tenant && e.category == category)
            .map(|e| (e, e.score(query)))
            .filter(|(_, score)| *score >= self.match_threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(e, score)| KnowledgeMatch {
                id: e.id,
                answer: e.answer.clone(),
                score,
                origin: e.origin,
            })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn learned_count(&self) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.origin == KnowledgeOrigin::Learned)
            .count()
    }

    pub async fn entries(&self) -> Vec<KnowledgeEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<KnowledgeEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Curated entries are always admitted
    pub(crate) async fn insert_curated(&self, entry: KnowledgeEntry) -> Uuid {
        let id = entry.id;
        self.entries.write().await.push(entry);
        info!("Added curated knowledge pattern {}", id);
        id
    }

    /// Learned entries are refused once the store is at capacity
    pub(crate) async fn insert_learned(&self, entry: KnowledgeEntry) -> Option<Uuid> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            debug!(
                "Knowledge store full ({} entries), refusing learned pattern",
                entries.len()
            );
            return None;
        }
        let id = entry.id;
        entries.push(entry);
        Some(id)
    }

    /// Remove a learned entry; curated entries are never retracted
    pub(crate) async fn retract(&self, id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| !(e.id == id && e.origin == KnowledgeOrigin::Learned));
        before != entries.len()
    }

    /// Write every entry to a pretty-printed JSON document
    pub async fn export_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = KnowledgeSnapshot {
            exported_at: Utc::now(),
            entries: self.entries().await,
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path.as_ref(), content).await?;
        info!(
            "Exported {} knowledge entries to {:?}",
            snapshot.entries.len(),
            path.as_ref()
        );
        Ok(())
    }

    /// Build a store from an exported document, recompiling every pattern
    pub async fn load_json(
        path: impl AsRef<Path>,
        capacity: usize,
        match_threshold: f64,
    ) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let snapshot: KnowledgeSnapshot = serde_json::from_slice(&raw)?;

        let mut entries = Vec::with_capacity(snapshot.entries.len());
        for mut entry in snapshot.entries {
            entry.compile()?;
            entries.push(entry);
        }
        info!(
            "Loaded {} knowledge entries from {:?}",
            entries.len(),
            path.as_ref()
        );

        Ok(Self {
            entries: RwLock::new(entries),
            capacity,
            match_threshold,
        })
    }
}
