//! # Ouroboros Cache (ouroboros-cache)
//!
//! A multi-tier response cache for expensive generation backends (LLM calls,
//! heavyweight aggregations) with approximate matching and adaptive pattern
//! promotion.
//!
//! ## Features
//!
//! - Arabic/Latin aware normalization and tenant-scoped 128-bit fingerprints
//! - Memory, shared (Redis) and persistent (disk or Neo4j) tiers with per-tier timeouts
//! - Token-overlap similarity fallback with a strict threshold
//! - Byte-budgeted memory tier with priority-aware eviction and a periodic TTL sweep
//! - Pattern learner that promotes recurring query clusters into a curated knowledge store
//!
//! ## Quick start
//!
//! ```no_run
//! use ouroboros_cache::{CacheConfig, CacheOrchestrator, FileTier};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistent = Arc::new(FileTier::open("./cache-data").await?);
//!     let cache = CacheOrchestrator::new(CacheConfig::from_env()?, persistent)?;
//!
//!     let result = cache.lookup("كيف ألغي العقد", "t1", "legal").await;
//!     if !result.is_hit() {
//!         let answer = "...generated answer...";
//!         cache.store("كيف ألغي العقد", "t1", "legal", answer, 0.9).await?;
//!     }
//!
//!     println!("{}", cache.stats().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Shared tier over Redis
//!
//! ```no_run
//! use ouroboros_cache::{CacheConfig, CacheOrchestrator, FileTier, RedisKv, SharedTier};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let redis = RedisKv::connect("redis://127.0.0.1:6379").await?;
//!     let cache = CacheOrchestrator::builder(CacheConfig::default())
//!         .shared_tier(Arc::new(SharedTier::new(Arc::new(redis))))
//!         .persistent_tier(Arc::new(FileTier::open("./cache-data").await?))
//!         .build()?;
//!
//!     cache.start().await;
//!     // ...
//!     cache.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheOrchestrator, CacheStats, FileTier,
    Fingerprint, HitKind, InProcessKv, KnowledgeStore, LookupResult, MemoryTier, Neo4jTier,
    PatternLearner, Payload, Priority, RedisKv, SharedTier, StoreOptions, StoreOutcome, TierKind,
    TierStore,
};
pub use error::{CacheError, Result};
