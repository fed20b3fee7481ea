//! The lookup chain
//!
//! A lookup walks an ordered list of resolvers (knowledge patterns, exact
//! fingerprint across tiers, token-overlap similarity) and stops at the first
//! one that answers. Each resolver only reads; promotion and bookkeeping
//! belong to the orchestrator.

use crate::cache::entry::CacheEntry;
use crate::cache::knowledge::KnowledgeStore;
use crate::cache::normalize::NormalizedQuery;
use crate::cache::similarity::SimilarityResolver;
use crate::cache::tier::TierSet;
use crate::cache::types::{Fingerprint, HitKind, HitSource, Payload, TierKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Everything a resolver may need about the query being looked up
#[derive(Debug, Clone)]
pub struct LookupContext {
    pub tenant: String,
    pub category: String,
    pub normalized: NormalizedQuery,
    pub fingerprint: Fingerprint,
}

/// A resolver's answer
#[derive(Debug, Clone)]
pub struct Resolution {
    pub payload: Payload,
    pub hit_kind: HitKind,
    pub source: HitSource,

    /// Knowledge or similarity score; `None` for exact matches
    pub score: Option<f64>,

    /// The cached entry behind the answer, when there is one
    pub entry: Option<CacheEntry>,

    /// Tier the entry was read from
    pub found_in: Option<TierKind>,
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, ctx: &LookupContext) -> Option<Resolution>;
}

/// Curated and learned patterns, checked before any tier
pub struct KnowledgeResolver {
    knowledge: Arc<KnowledgeStore>,
}

impl KnowledgeResolver {
    pub fn new(knowledge: Arc<KnowledgeStore>) -> Self {
        Self { knowledge }
    }
}

#[async_trait]
impl Resolver for KnowledgeResolver {
    fn name(&self) -> &'static str {
        "knowledge"
    }

    async fn resolve(&self, ctx: &LookupContext) -> Option<Resolution> {
        let found = self
            .knowledge
            .find(&ctx.tenant, &ctx.category, &ctx.normalized)
            .await?;

        debug!("Knowledge hit {} (score {:.3})", found.id, found.score);
        Some(Resolution {
            payload: found.answer,
            hit_kind: HitKind::Knowledge,
            source: HitSource::Knowledge,
            score: Some(found.score),
            entry: None,
            found_in: None,
        })
    }
}

/// Exact fingerprint match, fastest tier first
pub struct FingerprintResolver {
    tiers: Arc<TierSet>,
}

impl FingerprintResolver {
    pub fn new(tiers: Arc<TierSet>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl Resolver for FingerprintResolver {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    async fn resolve(&self, ctx: &LookupContext) -> Option<Resolution> {
        for kind in self.tiers.kinds() {
            let Some(mut entry) = self.tiers.get(kind, &ctx.fingerprint).await else {
                continue;
            };
            if entry.is_expired() {
                continue;
            }

            // Records from the tier of record carry no working set
            entry.rehydrate(&ctx.normalized);

            debug!("Fingerprint hit {} in {} tier", ctx.fingerprint, kind);
            return Some(Resolution {
                payload: entry.payload.clone(),
                hit_kind: HitKind::Fingerprint,
                source: HitSource::Tier(kind),
                score: None,
                entry: Some(entry),
                found_in: Some(kind),
            });
        }
        None
    }
}

/// Token-overlap fallback over recent memory and shared entries
pub struct SimilarityChainResolver {
    tiers: Arc<TierSet>,
    similarity: SimilarityResolver,
    candidate_limit: usize,
}

impl SimilarityChainResolver {
    pub fn new(tiers: Arc<TierSet>, threshold: f64, candidate_limit: usize) -> Self {
        Self {
            tiers,
            similarity: SimilarityResolver::new(threshold, candidate_limit),
            candidate_limit,
        }
    }
}

#[async_trait]
impl Resolver for SimilarityChainResolver {
    fn name(&self) -> &'static str {
        "similarity"
    }

    async fn resolve(&self, ctx: &LookupContext) -> Option<Resolution> {
        if ctx.normalized.is_empty() {
            return None;
        }

        let candidates = self
            .tiers
            .candidates(&ctx.tenant, &ctx.category, self.candidate_limit)
            .await;
        let live: Vec<&CacheEntry> = candidates.iter().filter(|c| !c.is_expired()).collect();

        let found = self.similarity.find_similar(
            &ctx.normalized.tokens,
            &ctx.category,
            &ctx.tenant,
            live,
        )?;

        debug!(
            "Similar hit {} for {} (score {:.3})",
            found.entry.fingerprint, ctx.fingerprint, found.score
        );
        Some(Resolution {
            payload: found.entry.payload.clone(),
            hit_kind: HitKind::Similar,
            source: HitSource::Similar,
            score: Some(found.score),
            entry: Some(found.entry),
            found_in: None,
        })
    }
}
