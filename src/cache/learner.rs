//! Pattern learning: clusters recurring queries and promotes them to knowledge
//!
//! Each `(tenant, category)` partition keeps a bounded pool of unclustered
//! observations. Two observations sharing at least two keywords form a
//! cluster; clusters sharing at least half their keywords merge. A cluster
//! whose frequency and mean confidence cross the configured thresholds is
//! promoted into the [`KnowledgeStore`]. A later payload that disagrees with
//! the cluster template demotes it back to observing and retracts the
//! knowledge entry.
//!
//! Clusters live in an append-only arena and every transition is appended to
//! an event log, so the history of a pattern can always be audited.

use crate::cache::config::CacheConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::knowledge::{KnowledgeEntry, KnowledgeOrigin, KnowledgeStore, MAX_PATTERN_KEYWORDS};
use crate::cache::normalize::Normalizer;
use crate::cache::similarity::jaccard;
use crate::cache::types::{Fingerprint, Payload};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Minimum shared keywords for two entries to cluster
const MIN_SHARED_KEYWORDS: usize = 2;

/// Keyword overlap (relative to the smaller cluster) at which clusters merge
const MERGE_OVERLAP: f64 = 0.5;

/// Index into the cluster arena
pub type ClusterId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Tracking members but not accumulating toward promotion
    Observing,
    /// Just formed from pooled observations
    Clustering,
    /// Frequency and confidence tracked toward promotion
    Candidate,
    /// Answer published to the knowledge store
    Promoted,
    /// Merged away or emptied; kept only for the audit trail
    Retired,
}

/// A family of similar queries with a shared answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCluster {
    pub id: ClusterId,
    pub tenant: String,
    pub category: String,

    /// Representative keyword set (intersection of member keywords)
    pub keywords: BTreeSet<String>,

    pub members: BTreeSet<Fingerprint>,

    /// Observations counted toward promotion since the last reset
    pub frequency: u64,

    confidence_sum: f64,

    pub template: Payload,

    #[serde(skip)]
    template_tokens: BTreeSet<String>,

    /// Canonical text of the founding member; fixes keyword order in patterns
    pub representative: String,

    pub state: ClusterState,

    pub knowledge_id: Option<Uuid>,
}

impl PatternCluster {
    pub fn mean_confidence(&self) -> f64 {
        if self.frequency == 0 {
            0.0
        } else {
            self.confidence_sum / self.frequency as f64
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != ClusterState::Retired
    }

    /// Keywords in the order they appear in the representative text, then
    /// any remaining ones alphabetically
    pub fn ordered_keywords(&self) -> Vec<String> {
        let mut ordered: Vec<String> = Vec::new();
        for token in self.representative.split_whitespace() {
            if self.keywords.contains(token) && !ordered.iter().any(|k| k == token) {
                ordered.push(token.to_string());
            }
        }
        for keyword in &self.keywords {
            if !ordered.contains(keyword) {
                ordered.push(keyword.clone());
            }
        }
        ordered.truncate(MAX_PATTERN_KEYWORDS);
        ordered
    }

    fn reset(&mut self, template: Payload, template_tokens: BTreeSet<String>, confidence: f64) {
        self.template = template;
        self.template_tokens = template_tokens;
        self.frequency = 1;
        self.confidence_sum = confidence;
        self.state = ClusterState::Observing;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEventKind {
    Formed { members: Vec<Fingerprint> },
    Joined { member: Fingerprint },
    Merged { into: ClusterId },
    Promoted { knowledge_id: Uuid },
    PromotionRefused,
    Demoted,
    MemberRemoved { member: Fingerprint },
    Retired,
}

/// One entry in the append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub at: DateTime<Utc>,
    pub cluster: ClusterId,
    pub kind: ClusterEventKind,
}

/// What an observation changed, for statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveOutcome {
    pub promoted: bool,
    pub demoted: bool,
}

#[derive(Debug, Clone)]
struct Observation {
    fingerprint: Fingerprint,
    canonical: String,
    keywords: BTreeSet<String>,
    payload: Payload,
    payload_tokens: BTreeSet<String>,
    confidence: f64,
}

#[derive(Debug, Default)]
struct Partition {
    pool: VecDeque<Observation>,
    clusters: Vec<ClusterId>,
}

#[derive(Debug, Default)]
struct LearnerState {
    arena: Vec<PatternCluster>,
    events: Vec<ClusterEvent>,
    partitions: HashMap<(String, String), Partition>,
}

impl LearnerState {
    fn log(&mut self, cluster: ClusterId, kind: ClusterEventKind) {
        self.events.push(ClusterEvent {
            at: Utc::now(),
            cluster,
            kind,
        });
    }
}

#[derive(Debug, Clone)]
struct LearnerSettings {
    promotion_frequency: u64,
    promotion_confidence: f64,
    payload_agreement: f64,
    observation_window: usize,
}

/// Observes accepted entries and owns all writes to the knowledge store
pub struct PatternLearner {
    settings: LearnerSettings,
    normalizer: Normalizer,
    knowledge: Arc<KnowledgeStore>,
    state: Mutex<LearnerState>,
}

impl PatternLearner {
    pub fn new(config: &CacheConfig, knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            settings: LearnerSettings {
                promotion_frequency: config.promotion_frequency,
                promotion_confidence: config.promotion_confidence,
                payload_agreement: config.payload_agreement,
                observation_window: config.observation_window,
            },
            normalizer: Normalizer::new(&config.stop_words),
            knowledge,
            state: Mutex::new(LearnerState::default()),
        }
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    /// Feed an accepted entry
    pub async fn observe(&self, entry: &CacheEntry) -> ObserveOutcome {
        let keywords: BTreeSet<String> = entry
            .token_set
            .iter()
            .filter(|t| t.chars().count() > 2)
            .cloned()
            .collect();
        if keywords.len() < MIN_SHARED_KEYWORDS {
            return ObserveOutcome::default();
        }

        let observation = Observation {
            fingerprint: entry.fingerprint.clone(),
            canonical: entry.normalized_text.clone(),
            keywords,
            payload_tokens: self.normalizer.normalize(&entry.payload.as_text()).tokens,
            payload: entry.payload.clone(),
            confidence: entry.confidence,
        };

        let mut state = self.state.lock().await;
        let partition_key = (entry.tenant.clone(), entry.category.clone());
        let mut outcome = ObserveOutcome::default();

        let target = match self.best_cluster(&state, &partition_key, &observation) {
            Some(id) => {
                outcome.demoted = self.join(&mut state, id, &observation).await;
                Some(id)
            }
            None => self.form_from_pool(&mut state, &partition_key, observation),
        };

        let Some(id) = target else {
            return outcome;
        };

        self.merge_overlapping(&mut state, &partition_key, id).await;
        outcome.promoted = self.maybe_promote(&mut state, id).await;
        outcome
    }

    /// Live cluster in the partition with the largest keyword overlap (≥ 2)
    fn best_cluster(
        &self,
        state: &LearnerState,
        partition_key: &(String, String),
        observation: &Observation,
    ) -> Option<ClusterId> {
        let partition = state.partitions.get(partition_key)?;
        partition
            .clusters
            .iter()
            .map(|&id| &state.arena[id])
            .filter(|c| c.is_live())
            .map(|c| (c.id, c.keywords.intersection(&observation.keywords).count()))
            .filter(|(_, overlap)| *overlap >= MIN_SHARED_KEYWORDS)
            .max_by_key(|(_, overlap)| *overlap)
            .map(|(id, _)| id)
    }

    /// Add an observation to a cluster. Returns whether a promoted cluster
    /// was demoted by a contradicting payload.
    async fn join(&self, state: &mut LearnerState, id: ClusterId, observation: &Observation) -> bool {
        let agreement = jaccard(&observation.payload_tokens, &state.arena[id].template_tokens);
        let contradicts = agreement < self.settings.payload_agreement;

        let is_new_member = {
            let cluster = &mut state.arena[id];
            let intersection: BTreeSet<String> = cluster
                .keywords
                .intersection(&observation.keywords)
                .cloned()
                .collect();
            cluster.keywords = intersection;
            cluster.members.insert(observation.fingerprint.clone())
        };
        if is_new_member {
            state.log(
                id,
                ClusterEventKind::Joined {
                    member: observation.fingerprint.clone(),
                },
            );
        }

        if contradicts {
            return self.demote(state, id, observation).await;
        }

        let cluster = &mut state.arena[id];
        cluster.frequency += 1;
        cluster.confidence_sum += observation.confidence;
        if cluster.state == ClusterState::Observing {
            cluster.state = ClusterState::Candidate;
        }
        false
    }

    /// Revert to observing with the new payload as template
    async fn demote(&self, state: &mut LearnerState, id: ClusterId, observation: &Observation) -> bool {
        let was_promoted = state.arena[id].state == ClusterState::Promoted;
        if let Some(knowledge_id) = state.arena[id].knowledge_id.take() {
            self.knowledge.retract(knowledge_id).await;
        }

        state.arena[id].reset(
            observation.payload.clone(),
            observation.payload_tokens.clone(),
            observation.confidence,
        );
        state.log(id, ClusterEventKind::Demoted);

        if was_promoted {
            info!("Demoted pattern cluster {} after contradicting payload", id);
        } else {
            debug!("Cluster {} reset after contradicting payload", id);
        }
        was_promoted
    }

    /// Pair the observation with a pooled one sharing ≥ 2 keywords, or pool it
    fn form_from_pool(
        &self,
        state: &mut LearnerState,
        partition_key: &(String, String),
        observation: Observation,
    ) -> Option<ClusterId> {
        let partition = state.partitions.entry(partition_key.clone()).or_default();

        // A repeat of a pooled query only refreshes the pooled copy
        partition
            .pool
            .retain(|o| o.fingerprint != observation.fingerprint);

        let partner = partition
            .pool
            .iter()
            .enumerate()
            .map(|(i, o)| (i, o.keywords.intersection(&observation.keywords).count()))
            .filter(|(_, overlap)| *overlap >= MIN_SHARED_KEYWORDS)
            .max_by_key(|(_, overlap)| *overlap)
            .map(|(i, _)| i);

        let Some(index) = partner else {
            partition.pool.push_back(observation);
            while partition.pool.len() > self.settings.observation_window {
                partition.pool.pop_front();
            }
            return None;
        };

        let founder = partition.pool.remove(index)?;
        let id = state.arena.len();
        partition.clusters.push(id);

        let keywords = founder
            .keywords
            .intersection(&observation.keywords)
            .cloned()
            .collect();
        let agrees = jaccard(&observation.payload_tokens, &founder.payload_tokens)
            >= self.settings.payload_agreement;

        let mut cluster = PatternCluster {
            id,
            tenant: partition_key.0.clone(),
            category: partition_key.1.clone(),
            keywords,
            members: [founder.fingerprint.clone(), observation.fingerprint.clone()]
                .into_iter()
                .collect(),
            frequency: 2,
            confidence_sum: founder.confidence + observation.confidence,
            template: founder.payload.clone(),
            template_tokens: founder.payload_tokens.clone(),
            representative: founder.canonical.clone(),
            state: ClusterState::Clustering,
            knowledge_id: None,
        };

        let members = cluster.members.iter().cloned().collect();
        state.arena.push(cluster.clone());
        state.log(id, ClusterEventKind::Formed { members });

        if agrees {
            cluster.state = ClusterState::Candidate;
        } else {
            cluster.reset(
                observation.payload.clone(),
                observation.payload_tokens.clone(),
                observation.confidence,
            );
        }
        state.arena[id] = cluster;

        debug!("Formed pattern cluster {} in {:?}", id, partition_key);
        Some(id)
    }

    /// Fold live clusters sharing ≥ 50% keywords with `target` into it.
    /// Clusters whose templates disagree are left alone.
    async fn merge_overlapping(
        &self,
        state: &mut LearnerState,
        partition_key: &(String, String),
        target: ClusterId,
    ) {
        let Some(partition) = state.partitions.get(partition_key) else {
            return;
        };

        let others: Vec<ClusterId> = partition
            .clusters
            .iter()
            .copied()
            .filter(|&id| id != target && state.arena[id].is_live())
            .collect();

        for other in others {
            let (t, o) = (&state.arena[target], &state.arena[other]);
            let smaller = t.keywords.len().min(o.keywords.len());
            if smaller == 0 {
                continue;
            }
            let overlap = t.keywords.intersection(&o.keywords).count() as f64 / smaller as f64;
            if overlap < MERGE_OVERLAP {
                continue;
            }
            if jaccard(&t.template_tokens, &o.template_tokens) < self.settings.payload_agreement {
                continue;
            }

            let intersection: BTreeSet<String> =
                t.keywords.intersection(&o.keywords).cloned().collect();
            let keywords = if intersection.len() >= MIN_SHARED_KEYWORDS {
                intersection
            } else if t.keywords.len() >= o.keywords.len() {
                t.keywords.clone()
            } else {
                o.keywords.clone()
            };

            let absorbed = state.arena[other].clone();
            if let Some(knowledge_id) = absorbed.knowledge_id {
                self.knowledge.retract(knowledge_id).await;
            }

            {
                let cluster = &mut state.arena[target];
                cluster.keywords = keywords;
                cluster.members.extend(absorbed.members.iter().cloned());
                cluster.frequency += absorbed.frequency;
                cluster.confidence_sum += absorbed.confidence_sum;
            }
            {
                let retired = &mut state.arena[other];
                retired.state = ClusterState::Retired;
                retired.knowledge_id = None;
            }
            state.log(other, ClusterEventKind::Merged { into: target });
            debug!("Merged pattern cluster {} into {}", other, target);
        }
    }

    /// Promote when frequency and mean confidence cross the thresholds
    async fn maybe_promote(&self, state: &mut LearnerState, id: ClusterId) -> bool {
        let cluster = &state.arena[id];
        if cluster.state != ClusterState::Candidate
            || cluster.frequency < self.settings.promotion_frequency
            || cluster.mean_confidence() < self.settings.promotion_confidence
            || cluster.keywords.len() < MIN_SHARED_KEYWORDS
        {
            return false;
        }

        let keywords = cluster.ordered_keywords();
        let entry = match KnowledgeEntry::new(
            cluster.tenant.clone(),
            cluster.category.clone(),
            KnowledgeEntry::pattern_for(&keywords),
            keywords,
            cluster.template.clone(),
            cluster.mean_confidence(),
            KnowledgeOrigin::Learned,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Cluster {} produced an unusable pattern: {}", id, e);
                return false;
            }
        };

        match self.knowledge.insert_learned(entry).await {
            Some(knowledge_id) => {
                let cluster = &mut state.arena[id];
                cluster.state = ClusterState::Promoted;
                cluster.knowledge_id = Some(knowledge_id);
                info!(
                    "Promoted pattern cluster {} ({} members, frequency {})",
                    id,
                    cluster.members.len(),
                    cluster.frequency
                );
                state.log(id, ClusterEventKind::Promoted { knowledge_id });
                true
            }
            None => {
                state.log(id, ClusterEventKind::PromotionRefused);
                false
            }
        }
    }

    /// Drop a fingerprint from every cluster and pool. An emptied cluster is
    /// retired and its knowledge entry retracted.
    pub async fn forget(&self, fingerprint: &Fingerprint) {
        let mut state = self.state.lock().await;

        for partition in state.partitions.values_mut() {
            partition.pool.retain(|o| &o.fingerprint != fingerprint);
        }

        let holding: Vec<ClusterId> = state
            .arena
            .iter()
            .filter(|c| c.is_live() && c.members.contains(fingerprint))
            .map(|c| c.id)
            .collect();

        for id in holding {
            state.arena[id].members.remove(fingerprint);
            state.log(
                id,
                ClusterEventKind::MemberRemoved {
                    member: fingerprint.clone(),
                },
            );

            if state.arena[id].members.is_empty() {
                if let Some(knowledge_id) = state.arena[id].knowledge_id.take() {
                    self.knowledge.retract(knowledge_id).await;
                }
                state.arena[id].state = ClusterState::Retired;
                state.log(id, ClusterEventKind::Retired);
                debug!("Retired empty pattern cluster {}", id);
            }
        }
    }

    /// Add a hand-authored pattern. Keywords are normalized like queries;
    /// without an explicit regex one is built from the keywords in order.
    pub async fn seed_curated(
        &self,
        tenant: &str,
        category: &str,
        keywords: &[&str],
        answer: Payload,
        pattern: Option<&str>,
    ) -> Result<Uuid> {
        let mut normalized: Vec<String> = Vec::new();
        for keyword in keywords {
            for token in self.normalizer.normalize(keyword).canonical.split_whitespace() {
                if !normalized.iter().any(|k| k == token) {
                    normalized.push(token.to_string());
                }
            }
        }
        if normalized.is_empty() {
            return Err(CacheError::Validation(
                "curated pattern needs at least one keyword".to_string(),
            ));
        }

        let pattern = pattern
            .map(str::to_string)
            .unwrap_or_else(|| KnowledgeEntry::pattern_for(&normalized));
        let entry = KnowledgeEntry::new(
            tenant,
            category,
            pattern,
            normalized,
            answer,
            1.0,
            KnowledgeOrigin::Curated,
        )?;

        Ok(self.knowledge.insert_curated(entry).await)
    }

    /// Snapshot of the audit log
    pub async fn events(&self) -> Vec<ClusterEvent> {
        self.state.lock().await.events.clone()
    }

    /// Snapshot of every cluster ever formed, retired ones included
    pub async fn clusters(&self) -> Vec<PatternCluster> {
        self.state.lock().await.arena.clone()
    }

    pub async fn promoted_count(&self) -> u64 {
        self.state
            .lock()
            .await
            .arena
            .iter()
            .filter(|c| c.state == ClusterState::Promoted)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::FingerprintIndex;

    fn learner() -> PatternLearner {
        learner_with(CacheConfig::default())
    }

    fn learner_with(config: CacheConfig) -> PatternLearner {
        let knowledge = Arc::new(KnowledgeStore::new(
            config.knowledge_capacity,
            config.knowledge_match_threshold,
        ));
        PatternLearner::new(&config, knowledge)
    }

    fn entry(query: &str, answer: &str, confidence: f64) -> CacheEntry {
        let normalized = Normalizer::default().normalize(query);
        let fp = FingerprintIndex::new().fingerprint(&normalized.canonical, "acme");
        CacheEntry::new(fp, "acme", "billing", &normalized, Payload::from(answer), confidence)
    }

    const ANSWER: &str = "Electronics can be refunded within 14 days of delivery";

    #[tokio::test]
    async fn test_pool_then_cluster_formation() {
        let learner = learner();
        learner.observe(&entry("refund policy for electronics", ANSWER, 0.9)).await;
        assert!(learner.clusters().await.is_empty());

        learner.observe(&entry("electronics refund policy", ANSWER, 0.9)).await;
        let clusters = learner.clusters().await;
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].state, ClusterState::Candidate);
        assert_eq!(clusters[0].frequency, 2);
        assert_eq!(clusters[0].members.len(), 2);
    }

    #[tokio::test]
    async fn test_unrelated_entries_do_not_cluster() {
        let learner = learner();
        learner.observe(&entry("refund policy electronics", ANSWER, 0.9)).await;
        learner.observe(&entry("shipping times europe", "3-5 days", 0.9)).await;
        assert!(learner.clusters().await.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_after_threshold() {
        let learner = learner();
        let mut promoted = false;
        for q in [
            "refund policy for electronics",
            "electronics refund policy",
            "refund policy on electronics purchases",
        ] {
            promoted |= learner.observe(&entry(q, ANSWER, 0.9)).await.promoted;
        }
        assert!(promoted);
        assert_eq!(learner.promoted_count().await, 1);
        assert_eq!(learner.knowledge().learned_count().await, 1);

        let knowledge = learner.knowledge().entries().await;
        assert_eq!(knowledge[0].keywords, vec!["refund", "policy", "electronics"]);
    }

    #[tokio::test]
    async fn test_low_confidence_blocks_promotion() {
        let learner = learner();
        for q in [
            "refund policy for electronics",
            "electronics refund policy",
            "refund policy on electronics purchases",
        ] {
            learner.observe(&entry(q, ANSWER, 0.75)).await;
        }
        assert_eq!(learner.promoted_count().await, 0);
    }

    #[tokio::test]
    async fn test_contradiction_demotes_and_retracts() {
        let learner = learner();
        for q in [
            "refund policy for electronics",
            "electronics refund policy",
            "refund policy on electronics purchases",
        ] {
            learner.observe(&entry(q, ANSWER, 0.9)).await;
        }
        assert_eq!(learner.knowledge().learned_count().await, 1);

        let outcome = learner
            .observe(&entry(
                "electronics refund policy today",
                "Store credit only, no cash back",
                0.9,
            ))
            .await;
        assert!(outcome.demoted);

        let clusters = learner.clusters().await;
        assert_eq!(clusters[0].state, ClusterState::Observing);
        assert_eq!(clusters[0].frequency, 1);
        assert_eq!(learner.knowledge().learned_count().await, 0);

        let events = learner.events().await;
        assert!(events.iter().any(|e| e.kind == ClusterEventKind::Demoted));
    }

    #[tokio::test]
    async fn test_forget_retires_empty_cluster() {
        let learner = learner();
        let a = entry("refund policy for electronics", ANSWER, 0.9);
        let b = entry("electronics refund policy", ANSWER, 0.9);
        let c = entry("refund policy on electronics purchases", ANSWER, 0.9);
        for e in [&a, &b, &c] {
            learner.observe(e).await;
        }
        assert_eq!(learner.promoted_count().await, 1);

        learner.forget(&a.fingerprint).await;
        learner.forget(&b.fingerprint).await;
        assert_eq!(learner.promoted_count().await, 1);

        learner.forget(&c.fingerprint).await;
        // forgetting twice is harmless
        learner.forget(&c.fingerprint).await;

        let clusters = learner.clusters().await;
        assert_eq!(clusters[0].state, ClusterState::Retired);
        assert_eq!(learner.knowledge().learned_count().await, 0);
        assert!(learner
            .events()
            .await
            .iter()
            .any(|e| e.kind == ClusterEventKind::Retired));
    }

    #[tokio::test]
    async fn test_overlapping_clusters_merge() {
        let config = CacheConfig::builder().promotion_frequency(10).build();
        let learner = learner_with(config);

        // two clusters: {alpha, bravo, charlie} and {charlie, delta, echo}
        learner.observe(&entry("alpha bravo charlie", ANSWER, 0.9)).await;
        learner.observe(&entry("alpha bravo charlie foxtrot", ANSWER, 0.9)).await;
        learner.observe(&entry("charlie delta echo", ANSWER, 0.9)).await;
        learner.observe(&entry("charlie delta echo golf", ANSWER, 0.9)).await;
        assert_eq!(
            learner.clusters().await.iter().filter(|c| c.is_live()).count(),
            2
        );

        // the bridging entry narrows one cluster to two keywords, so the pair
        // now overlaps by half and merges
        learner.observe(&entry("bravo charlie delta", ANSWER, 0.9)).await;
        let clusters = learner.clusters().await;
        let live: Vec<_> = clusters.iter().filter(|c| c.is_live()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].members.len(), 5);
        assert!(learner
            .events()
            .await
            .iter()
            .any(|e| matches!(e.kind, ClusterEventKind::Merged { .. })));
    }

    #[tokio::test]
    async fn test_knowledge_capacity_refuses_promotion() {
        let config = CacheConfig::builder().knowledge_capacity(0).build();
        let learner = learner_with(config);
        for q in [
            "refund policy for electronics",
            "electronics refund policy",
            "refund policy on electronics purchases",
        ] {
            learner.observe(&entry(q, ANSWER, 0.9)).await;
        }
        assert_eq!(learner.promoted_count().await, 0);
        assert!(learner
            .events()
            .await
            .iter()
            .any(|e| e.kind == ClusterEventKind::PromotionRefused));
    }

    #[tokio::test]
    async fn test_seed_curated() {
        let learner = learner();
        let id = learner
            .seed_curated(
                "acme",
                "billing",
                &["Refund", "Policy"],
                Payload::from("See policy page"),
                None,
            )
            .await
            .unwrap();

        let entry = learner.knowledge().get(id).await.unwrap();
        assert_eq!(entry.origin, KnowledgeOrigin::Curated);
        assert_eq!(entry.keywords, vec!["refund", "policy"]);

        assert!(learner
            .seed_curated("acme", "billing", &["the"], Payload::from("x"), None)
            .await
            .is_err());
    }

    #[test]
    fn test_ordered_keywords_follow_representative() {
        let cluster = PatternCluster {
            id: 0,
            tenant: "t".into(),
            category: "c".into(),
            keywords: ["zeta", "alpha", "mid"].iter().map(|s| s.to_string()).collect(),
            members: BTreeSet::new(),
            frequency: 0,
            confidence_sum: 0.0,
            template: Payload::from("x"),
            template_tokens: BTreeSet::new(),
            representative: "zeta something alpha".to_string(),
            state: ClusterState::Candidate,
            knowledge_id: None,
        };
        assert_eq!(cluster.ordered_keywords(), vec!["zeta", "alpha", "mid"]);
    }
}
