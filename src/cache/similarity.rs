//! Token-overlap similarity fallback for fingerprint misses

use crate::cache::entry::CacheEntry;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// `|A ∩ B| / |A ∪ B|`; two empty sets score 0 so blank queries never match.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;

    intersection as f64 / union as f64
}

/// A candidate that cleared the threshold
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub entry: CacheEntry,
    pub score: f64,
}

/// Best-effort, bounded-cost approximate matcher.
///
/// Only candidates of the same tenant and category are scored, and at most
/// `candidate_limit` of them. False negatives are accepted; a candidate below
/// the threshold is never returned.
#[derive(Debug, Clone)]
pub struct SimilarityResolver {
    threshold: f64,
    candidate_limit: usize,
}

impl SimilarityResolver {
    pub fn new(threshold: f64, candidate_limit: usize) -> Self {
        Self {
            threshold,
            candidate_limit,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn find_similar<'a, I>(
        &self,
        tokens: &BTreeSet<String>,
        category: &str,
        tenant: &str,
        candidates: I,
    ) -> Option<SimilarMatch>
    where
        I: IntoIterator<Item = &'a CacheEntry>,
    {
        if tokens.is_empty() {
            return None;
        }

        let mut best: Option<(&CacheEntry, f64)> = None;

        for candidate in candidates
            .into_iter()
            .filter(|c| c.tenant == tenant && c.category == category)
            .take(self.candidate_limit)
        {
            let score = jaccard(tokens, &candidate.token_set);
            if score < self.threshold {
                continue;
            }

            best = match best {
                None => Some((candidate, score)),
                Some((current, current_score)) => {
                    if rank(candidate, score, current, current_score) == Ordering::Greater {
                        Some((candidate, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        best.map(|(entry, score)| SimilarMatch {
            entry: entry.clone(),
            score,
        })
    }
}

/// Higher score wins, then higher usage, then more recent use
fn rank(a: &CacheEntry, a_score: f64, b: &CacheEntry, b_score: f64) -> Ordering {
    a_score
        .partial_cmp(&b_score)
        .unwrap_or(Ordering::Equal)
        .then(a.usage_count.cmp(&b.usage_count))
        .then(a.last_used_at.cmp(&b.last_used_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintIndex;
    use crate::cache::normalize::NormalizedQuery;
    use crate::cache::types::Payload;

    fn tokens(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn entry(tenant: &str, category: &str, words: &[&str]) -> CacheEntry {
        let normalized = NormalizedQuery {
            canonical: words.join(" "),
            tokens: tokens(words),
        };
        let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, tenant);
        CacheEntry::new(fp, tenant, category, &normalized, Payload::from("answer"), 0.9)
    }

    #[test]
    fn test_jaccard() {
        let a = tokens(&["a", "b", "c"]);
        let b = tokens(&["b", "c", "d"]);
        assert_eq!(jaccard(&a, &b), 0.5);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&a, &BTreeSet::new()), 0.0);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_threshold_boundary() {
        // 17 shared of 20 total = 0.85 exactly
        let shared: Vec<String> = (0..17).map(|i| format!("w{}", i)).collect();
        let mut query: Vec<&str> = shared.iter().map(|s| s.as_str()).collect();
        query.extend(["q1", "q2"]);
        let mut stored: Vec<&str> = shared.iter().map(|s| s.as_str()).collect();
        stored.push("s1");

        let candidate = entry("t", "c", &stored);
        let resolver = SimilarityResolver::new(0.85, 50);
        let hit = resolver.find_similar(&tokens(&query), "c", "t", [&candidate]);
        assert_eq!(hit.map(|m| m.score), Some(0.85));

        // one more unshared token: 17 / 21 < 0.85
        query.push("q3");
        assert!(resolver
            .find_similar(&tokens(&query), "c", "t", [&candidate])
            .is_none());
    }

    #[test]
    fn test_scope_restricted_to_tenant_and_category() {
        let resolver = SimilarityResolver::new(0.5, 50);
        let other_tenant = entry("other", "pricing", &["price", "list"]);
        let other_category = entry("t", "status", &["price", "list"]);
        let q = tokens(&["price", "list"]);

        assert!(resolver
            .find_similar(&q, "pricing", "t", [&other_tenant, &other_category])
            .is_none());
    }

    #[test]
    fn test_tie_break_prefers_usage_then_recency() {
        let resolver = SimilarityResolver::new(0.5, 50);
        let mut popular = entry("t", "c", &["alpha", "beta"]);
        popular.usage_count = 10;
        let mut recent = entry("t", "c", &["alpha", "beta"]);
        recent.usage_count = 2;
        recent.last_used_at = popular.last_used_at + chrono::Duration::seconds(60);

        let hit = resolver
            .find_similar(&tokens(&["alpha", "beta"]), "c", "t", [&recent, &popular])
            .unwrap();
        assert_eq!(hit.entry.usage_count, 10);

        recent.usage_count = 10;
        let hit = resolver
            .find_similar(&tokens(&["alpha", "beta"]), "c", "t", [&popular, &recent])
            .unwrap();
        assert_eq!(hit.entry.last_used_at, recent.last_used_at);
    }

    #[test]
    fn test_candidate_limit_bounds_search() {
        let resolver = SimilarityResolver::new(0.9, 1);
        let far = entry("t", "c", &["unrelated"]);
        let near = entry("t", "c", &["alpha", "beta"]);
        assert!(resolver
            .find_similar(&tokens(&["alpha", "beta"]), "c", "t", [&far, &near])
            .is_none());
    }

    #[test]
    fn test_empty_query_never_matches() {
        let resolver = SimilarityResolver::new(0.0, 50);
        let candidate = entry("t", "c", &["alpha"]);
        assert!(resolver
            .find_similar(&BTreeSet::new(), "c", "t", [&candidate])
            .is_none());
    }
}
