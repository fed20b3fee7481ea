//! # Approximate-Match Tiered Cache
//!
//! Answers repeated and near-duplicate queries without calling the expensive
//! backend that produced the original answer.
//!
//! ## Lookup path
//!
//! 1. **Knowledge**: curated and learned patterns, never evicted
//! 2. **Fingerprint**: exact match on normalized text + tenant, Memory → Shared → Persistent
//! 3. **Similar**: Jaccard token overlap against recent entries of the same tenant and category
//!
//! A hit in a slower tier is promoted into the faster ones. Stores write the
//! persistent tier (the tier of record) first and feed the [`PatternLearner`],
//! which promotes recurring query clusters into the [`KnowledgeStore`].
//!
//! ## Example
//!
//! ```no_run
//! use ouroboros_cache::cache::{CacheConfig, CacheOrchestrator, FileTier, HitKind};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .similarity_threshold(0.85)
//!     .memory_budget_bytes(16 * 1024 * 1024) // 16 MB
//!     .build();
//!
//! let persistent = Arc::new(FileTier::open("/var/lib/qcache").await?);
//! let cache = CacheOrchestrator::new(config, persistent)?;
//! cache.start().await;
//!
//! cache
//!     .store("What is the refund policy?", "acme", "billing", "14 days", 0.9)
//!     .await?;
//!
//! let result = cache.lookup("what's the refund policy", "acme", "billing").await;
//! if result.hit_kind != HitKind::None {
//!     println!("Cache hit: {:?}", result.payload);
//! }
//!
//! cache.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod eviction;
pub mod fingerprint;
pub mod invalidation;
pub mod knowledge;
pub mod learner;
pub mod normalize;
pub mod orchestrator;
pub mod resolver;
pub mod similarity;
pub mod tier;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::CacheEntry;
pub use eviction::{EvictionConfig, EvictionManager, SweepHandle};
pub use fingerprint::FingerprintIndex;
pub use invalidation::{InvalidationEvent, InvalidationLog, InvalidationReason};
pub use knowledge::{KnowledgeEntry, KnowledgeMatch, KnowledgeOrigin, KnowledgeStore};
pub use learner::{ClusterEvent, ClusterEventKind, ClusterState, PatternCluster, PatternLearner};
pub use normalize::{NormalizedQuery, Normalizer};
pub use orchestrator::{
    CacheOrchestrator, CacheOrchestratorBuilder, LookupResult, RejectReason, StoreOptions,
    StoreOutcome, TopEntry,
};
pub use resolver::{LookupContext, Resolution, Resolver};
pub use similarity::{jaccard, SimilarMatch, SimilarityResolver};
pub use tier::{
    FileTier, InProcessKv, KeyValueBackend, MemoryTier, Neo4jTier, RedisKv, SharedTier, TierSet,
    TierStore,
};
pub use types::{CacheStats, Fingerprint, HitKind, Payload, Priority, TierKind};
