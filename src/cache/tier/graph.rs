//! Neo4j-backed tier of record
//!
//! Each record is a `(:CacheEntry)` node keyed by fingerprint. Timestamps are
//! stored as epoch milliseconds so expiry filters run inside Cypher.

use crate::cache::entry::CacheEntry;
use crate::cache::tier::persistent::PersistentRecord;
use crate::cache::tier::{SweepPolicy, SweepReport, TierStore};
use crate::cache::types::{Fingerprint, Payload, Priority, TierKind};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use neo4rs::{query, ConfigBuilder, Graph, Row};
use std::time::Duration;
use tracing::{debug, info};

const RETURN_FIELDS: &str = "e.fingerprint AS fingerprint, e.tenant AS tenant, \
     e.category AS category, e.payload AS payload, e.confidence AS confidence, \
     e.usage_count AS usage_count, e.created_at AS created_at, \
     e.last_used_at AS last_used_at, e.expires_at AS expires_at, e.priority AS priority";

/// Persistent tier over a Neo4j database
pub struct Neo4jTier {
    graph: Graph,
}

impl Neo4jTier {
    pub async fn connect(uri: &str, user: &str, password: &str, database: &str) -> Result<Self> {
        info!("Connecting persistent tier to Neo4j at {}", uri);

        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .db(database)
            .fetch_size(500)
            .max_connections(16)
            .build()
            .map_err(|e| CacheError::ConfigError(e.to_string()))?;

        let graph = Graph::connect(config)
            .await
            .map_err(|e| CacheError::unavailable(TierKind::Persistent, e.to_string()))?;

        let tier = Self { graph };
        tier.ensure_schema().await?;
        Ok(tier)
    }

    /// Connect using `NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD` and
    /// `NEO4J_DATABASE` (loaded from `.env` when present)
    pub async fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        let password = std::env::var("NEO4J_PASSWORD")
            .map_err(|_| CacheError::ConfigError("NEO4J_PASSWORD is not set".to_string()))?;

        Self::connect(
            &var("NEO4J_URI", "bolt://localhost:7687"),
            &var("NEO4J_USER", "neo4j"),
            &password,
            &var("NEO4J_DATABASE", "neo4j"),
        )
        .await
    }

    pub fn from_graph(graph: Graph) -> Self {
        Self { graph }
    }

    /// Uniqueness constraint on fingerprints (idempotent)
    pub async fn ensure_schema(&self) -> Result<()> {
        self.graph
            .run(query(
                "CREATE CONSTRAINT cache_entry_fingerprint IF NOT EXISTS
                 FOR (e:CacheEntry) REQUIRE e.fingerprint IS UNIQUE",
            ))
            .await
            .map_err(|e| {
                CacheError::unavailable(
                    TierKind::Persistent,
                    format!("Failed to create cache constraint: {}", e),
                )
            })
    }

    async fn fetch(&self, cypher: neo4rs::Query, what: &str) -> Result<Vec<Row>> {
        let mut result = self.graph.execute(cypher).await.map_err(|e| {
            CacheError::unavailable(TierKind::Persistent, format!("Failed to {}: {}", what, e))
        })?;

        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(|e| {
            CacheError::unavailable(TierKind::Persistent, format!("Failed to read row: {}", e))
        })? {
            rows.push(row);
        }
        Ok(rows)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn priority_code(priority: Priority) -> i64 {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Pinned => 3,
    }
}

fn priority_from_code(code: i64) -> Priority {
    match code {
        0 => Priority::Low,
        2 => Priority::High,
        3 => Priority::Pinned,
        _ => Priority::Normal,
    }
}

fn row_to_record(row: &Row) -> Result<PersistentRecord> {
    let fingerprint: String = row.get("fingerprint").unwrap_or_default();
    let corrupt = |message: String| CacheError::CorruptEntry {
        tier: TierKind::Persistent,
        key: fingerprint.clone(),
        message,
    };

    let text = |name: &str| -> Result<String> {
        row.get::<String>(name)
            .map_err(|e| corrupt(format!("missing {}: {}", name, e)))
    };
    let int = |name: &str| -> Result<i64> {
        row.get::<i64>(name)
            .map_err(|e| corrupt(format!("missing {}: {}", name, e)))
    };
    let time = |name: &str| -> Result<DateTime<Utc>> {
        from_millis(int(name)?).ok_or_else(|| corrupt(format!("invalid {}", name)))
    };

    let payload: Payload = serde_json::from_str(&text("payload")?)
        .map_err(|e| corrupt(format!("invalid payload: {}", e)))?;
    let confidence: f64 = row
        .get("confidence")
        .map_err(|e| corrupt(format!("missing confidence: {}", e)))?;

    Ok(PersistentRecord {
        fingerprint: Fingerprint::from(fingerprint.as_str()),
        tenant: text("tenant")?,
        category: text("category")?,
        payload,
        confidence,
        usage_count: int("usage_count")?.max(0) as u64,
        created_at: time("created_at")?,
        last_used_at: time("last_used_at")?,
        expires_at: time("expires_at")?,
        priority: priority_from_code(row.get::<i64>("priority").unwrap_or(1)),
    })
}

#[async_trait]
impl TierStore for Neo4jTier {
    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    async fn get(&self, key: &Fingerprint) -> Result<Option<CacheEntry>> {
        let cypher = query(&format!(
            "MATCH (e:CacheEntry {{fingerprint: $fingerprint}})
             WHERE e.expires_at > $now
             RETURN {}",
            RETURN_FIELDS
        ))
        .param("fingerprint", key.to_string())
        .param("now", to_millis(Utc::now()));

        let rows = self.fetch(cypher, "read cache entry").await?;
        match rows.first() {
            Some(row) => Ok(Some(row_to_record(row)?.into_entry())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &Fingerprint, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let record = PersistentRecord::from_entry(entry, ttl);
        let payload = serde_json::to_string(&record.payload)?;

        let cypher = query(
            "MERGE (e:CacheEntry {fingerprint: $fingerprint})
             WITH e, (e.expires_at IS NULL OR e.expires_at <= $now) AS fresh
             SET e.tenant = $tenant,
                 e.category = $category,
                 e.payload = $payload,
                 e.confidence = $confidence,
                 e.usage_count = CASE WHEN fresh OR e.usage_count < $usage_count
                                      THEN $usage_count ELSE e.usage_count END,
                 e.created_at = CASE WHEN fresh OR e.created_at > $created_at
                                     THEN $created_at ELSE e.created_at END,
                 e.last_used_at = CASE WHEN fresh OR e.last_used_at < $last_used_at
                                       THEN $last_used_at ELSE e.last_used_at END,
                 e.expires_at = $expires_at,
                 e.priority = $priority",
        )
        .param("fingerprint", key.to_string())
        .param("tenant", record.tenant.clone())
        .param("category", record.category.clone())
        .param("payload", payload)
        .param("confidence", record.confidence)
        .param("usage_count", record.usage_count as i64)
        .param("created_at", to_millis(record.created_at))
        .param("last_used_at", to_millis(record.last_used_at))
        .param("expires_at", to_millis(record.expires_at))
        .param("priority", priority_code(record.priority))
        .param("now", to_millis(Utc::now()));

        self.graph.run(cypher).await.map_err(|e| {
            CacheError::unavailable(
                TierKind::Persistent,
                format!("Failed to persist cache entry: {}", e),
            )
        })?;

        debug!("Persisted entry {} to Neo4j", key);
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        let cypher = query(
            "MATCH (e:CacheEntry {fingerprint: $fingerprint})
             DELETE e
             RETURN count(e) AS deleted_count",
        )
        .param("fingerprint", key.to_string());

        let rows = self.fetch(cypher, "delete cache entry").await?;
        let deleted: i64 = rows
            .first()
            .and_then(|row| row.get("deleted_count").ok())
            .unwrap_or(0);
        Ok(deleted > 0)
    }

    async fn touch(
        &self,
        key: &Fingerprint,
        usage_count: u64,
        last_used_at: DateTime<Utc>,
    ) -> Result<()> {
        let cypher = query(
            "MATCH (e:CacheEntry {fingerprint: $fingerprint})
             SET e.usage_count = CASE WHEN e.usage_count < $usage_count
                                      THEN $usage_count ELSE e.usage_count END,
                 e.last_used_at = CASE WHEN e.last_used_at < $last_used_at
                                       THEN $last_used_at ELSE e.last_used_at END",
        )
        .param("fingerprint", key.to_string())
        .param("usage_count", usage_count as i64)
        .param("last_used_at", to_millis(last_used_at));

        self.graph.run(cypher).await.map_err(|e| {
            CacheError::unavailable(
                TierKind::Persistent,
                format!("Failed to refresh cache entry usage: {}", e),
            )
        })
    }

    async fn scan_recent(
        &self,
        tenant: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let cypher = query(&format!(
            "MATCH (e:CacheEntry {{tenant: $tenant, category: $category}})
             WHERE e.expires_at > $now
             RETURN {}
             ORDER BY e.last_used_at DESC
             LIMIT $limit",
            RETURN_FIELDS
        ))
        .param("tenant", tenant.to_string())
        .param("category", category.to_string())
        .param("now", to_millis(Utc::now()))
        .param("limit", limit as i64);

        let rows = self.fetch(cypher, "scan cache entries").await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_record(row) {
                Ok(record) => entries.push(record.into_entry()),
                Err(e) => debug!("Skipping unreadable Neo4j record: {}", e),
            }
        }
        Ok(entries)
    }

    async fn sweep_expired(&self, policy: &SweepPolicy) -> Result<SweepReport> {
        let expired_query = query(
            "MATCH (e:CacheEntry)
             WHERE e.expires_at <= $now
             WITH e, e.fingerprint AS fingerprint
             DELETE e
             RETURN fingerprint",
        )
        .param("now", to_millis(policy.now));

        let mut report = SweepReport::default();
        for row in self.fetch(expired_query, "sweep expired entries").await? {
            match row.get::<String>("fingerprint") {
                Ok(fp) => report.expired.push(Fingerprint::from(fp.as_str())),
                Err(_) => report.errors += 1,
            }
        }

        if let Some(cutoff) = policy.stale_before {
            let stale_query = query(
                "MATCH (e:CacheEntry)
                 WHERE e.usage_count <= 1
                   AND e.confidence < $confidence
                   AND e.created_at < $cutoff
                 WITH e, e.fingerprint AS fingerprint
                 DELETE e
                 RETURN fingerprint",
            )
            .param("confidence", policy.stale_confidence)
            .param("cutoff", to_millis(cutoff));

            for row in self.fetch(stale_query, "purge stale entries").await? {
                match row.get::<String>("fingerprint") {
                    Ok(fp) => report.purged.push(Fingerprint::from(fp.as_str())),
                    Err(_) => report.errors += 1,
                }
            }
        }

        Ok(report)
    }
}
