//! Integration tests against real Redis and Neo4j backends
//!
//! All tests here are ignored by default. Run them with a live instance:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test backend_integration -- --ignored
//! NEO4J_URI=bolt://localhost:7687 NEO4J_PASSWORD=... cargo test --test backend_integration -- --ignored
//! ```

use ouroboros_cache::cache::{
    CacheConfig, CacheEntry, CacheOrchestrator, FingerprintIndex, HitKind, KeyValueBackend,
    Neo4jTier, Normalizer, Payload, RedisKv, SharedTier, TierStore,
};
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_tenant() -> String {
    format!("it-{}", uuid::Uuid::new_v4())
}

fn sample_entry(query: &str, tenant: &str) -> CacheEntry {
    let normalized = Normalizer::default().normalize(query);
    let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, tenant);
    CacheEntry::new(fp, tenant, "billing", &normalized, Payload::from("14 days"), 0.9)
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_kv_basic_contract() {
    let kv = RedisKv::connect(&redis_url()).await.unwrap();
    let key = format!("qcache:test:{}", uuid::Uuid::new_v4());

    kv.set_ex(&key, "value", Duration::from_secs(30)).await.unwrap();
    assert_eq!(kv.get(&key).await.unwrap(), Some("value".to_string()));
    assert!(kv.del(&key).await.unwrap());
    assert!(!kv.del(&key).await.unwrap());
    assert_eq!(kv.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_redis_shared_tier_roundtrip_and_scan() {
    let tier = SharedTier::new(Arc::new(RedisKv::connect(&redis_url()).await.unwrap()));
    let tenant = unique_tenant();
    let entry = sample_entry("refund policy", &tenant);

    tier.set(&entry.fingerprint, &entry, Duration::from_secs(30))
        .await
        .unwrap();

    let loaded = tier.get(&entry.fingerprint).await.unwrap().unwrap();
    assert_eq!(loaded.payload, entry.payload);
    assert_eq!(loaded.token_set, entry.token_set);

    let recent = tier.scan_recent(&tenant, "billing", 10).await.unwrap();
    assert_eq!(recent.len(), 1);

    assert!(tier.delete(&entry.fingerprint).await.unwrap());
    assert!(tier.scan_recent(&tenant, "billing", 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires running Neo4j instance
async fn test_neo4j_tier_roundtrip() {
    let tier = Neo4jTier::from_env().await.unwrap();
    let tenant = unique_tenant();
    let entry = sample_entry("refund policy", &tenant);

    tier.set(&entry.fingerprint, &entry, Duration::from_secs(60))
        .await
        .unwrap();

    let loaded = tier.get(&entry.fingerprint).await.unwrap().unwrap();
    assert_eq!(loaded.payload, entry.payload);
    assert_eq!(loaded.tenant, tenant);
    // the tier of record never stores the similarity working set
    assert!(loaded.token_set.is_empty());

    tier.touch(&entry.fingerprint, 7, chrono::Utc::now())
        .await
        .unwrap();
    let touched = tier.get(&entry.fingerprint).await.unwrap().unwrap();
    assert_eq!(touched.usage_count, 7);

    // rewriting the entry keeps its usage history
    let rewritten = sample_entry("refund policy", &tenant);
    tier.set(&rewritten.fingerprint, &rewritten, Duration::from_secs(60))
        .await
        .unwrap();
    let merged = tier.get(&entry.fingerprint).await.unwrap().unwrap();
    assert_eq!(merged.usage_count, 7);
    assert_eq!(
        merged.created_at.timestamp_millis(),
        touched.created_at.timestamp_millis()
    );

    assert!(tier.delete(&entry.fingerprint).await.unwrap());
    assert!(!tier.delete(&entry.fingerprint).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires running Redis and Neo4j instances
async fn test_orchestrator_over_real_backends() {
    let redis = RedisKv::connect(&redis_url()).await.unwrap();
    let neo4j = Neo4jTier::from_env().await.unwrap();

    let config = CacheConfig::builder()
        .shared_timeout(Duration::from_millis(500))
        .persistent_timeout(Duration::from_secs(2))
        .lookup_timeout(Duration::from_secs(5))
        .build();
    let cache = CacheOrchestrator::builder(config)
        .shared_tier(Arc::new(SharedTier::new(Arc::new(redis))))
        .persistent_tier(Arc::new(neo4j))
        .build()
        .unwrap();

    let tenant = unique_tenant();
    let outcome = cache
        .store("refund policy", &tenant, "billing", "14 days", 0.9)
        .await
        .unwrap();
    let fp = outcome.fingerprint().cloned().unwrap();

    cache.tiers().memory().delete(&fp).await.unwrap();
    let result = cache.lookup("refund policy", &tenant, "billing").await;
    assert_eq!(result.hit_kind, HitKind::Fingerprint);
    assert_eq!(cache.stats().await.tier_hits("shared"), 1);

    assert!(cache.invalidate(&fp).await);
    cache.stop().await;
}
