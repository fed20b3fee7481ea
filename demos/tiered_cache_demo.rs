//! Walks through the cache lifecycle: store, exact and similar hits,
//! pattern promotion, invalidation and the periodic sweep.
//!
//! ```text
//! RUST_LOG=ouroboros_cache=debug cargo run --example tiered_cache_demo
//! ```

use anyhow::Result;
use ouroboros_cache::cache::{
    CacheConfig, CacheOrchestrator, FileTier, InProcessKv, Payload, SharedTier,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ouroboros_cache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::temp_dir().join(format!("qcache-demo-{}", uuid::Uuid::new_v4()));
    let config = CacheConfig::builder()
        .sweep_interval(Duration::from_secs(1))
        .build();

    let cache = CacheOrchestrator::builder(config)
        .shared_tier(Arc::new(SharedTier::new(Arc::new(InProcessKv::new()))))
        .persistent_tier(Arc::new(FileTier::open(&data_dir).await?))
        .build()?;
    cache.start().await;

    println!("== exact and similar hits ==");
    cache
        .store(
            "How do I reset my account password?",
            "acme",
            "support",
            "Use the 'Forgot password' link on the sign-in page.",
            0.92,
        )
        .await?;

    for query in [
        "how do i RESET my account password",
        "reset account password",
        "reset account password link today",
        "where is my parcel",
    ] {
        let result = cache.lookup(query, "acme", "support").await;
        println!(
            "{:<40} -> {:<11} score={:?}",
            query,
            result.hit_kind.to_string(),
            result.score
        );
    }

    println!("\n== pattern promotion ==");
    let answer = "Electronics can be refunded within 14 days of delivery.";
    for query in [
        "refund policy for electronics",
        "electronics refund policy",
        "what is the refund policy on electronics purchases",
    ] {
        cache.store(query, "acme", "billing", answer, 0.9).await?;
    }
    for cluster in cache.learner().clusters().await {
        println!(
            "cluster {} {:?} keywords={:?} frequency={}",
            cluster.id, cluster.state, cluster.keywords, cluster.frequency
        );
    }

    let result = cache
        .lookup("electronics refund policy details", "acme", "billing")
        .await;
    println!("new phrasing -> {} ({:?})", result.hit_kind, result.payload);

    println!("\n== curated knowledge ==");
    cache
        .learner()
        .seed_curated(
            "acme",
            "support",
            &["opening", "hours"],
            Payload::from("Monday to Friday, 9am to 5pm"),
            None,
        )
        .await?;
    let result = cache
        .lookup("what are your opening hours", "acme", "support")
        .await;
    println!("opening hours -> {} ({:?})", result.hit_kind, result.payload);

    println!("\n== invalidation ==");
    let removed = cache
        .invalidate_query("How do I reset my account password?", "acme")
        .await?;
    println!("invalidated: {}", removed);
    let result = cache
        .lookup("how do i reset my account password", "acme", "support")
        .await;
    println!("after invalidate -> {}", result.hit_kind);

    println!("\n== top entries ==");
    for entry in cache.top_entries(5).await {
        println!(
            "{} tenant={} category={} used={}",
            entry.fingerprint, entry.tenant, entry.category, entry.usage_count
        );
    }

    let snapshot = data_dir.join("knowledge.json");
    cache.knowledge().export_json(&snapshot).await?;
    println!("\nknowledge snapshot written to {:?}", snapshot);

    cache.stop().await;
    println!("\n{}", cache.stats().await);

    tokio::fs::remove_dir_all(&data_dir).await.ok();
    Ok(())
}
