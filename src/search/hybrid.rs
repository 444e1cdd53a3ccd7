//! Hybrid ranking: semantic rank fused with great-circle distance.
//!
//! Two retrieval paths meet here. The semantic path ranks the whole corpus
//! against the query vector; the geographic path drops candidates outside the
//! user's radius. Fusion is multiplicative:
//!
//! ```text
//! score = 1 / (rank + 1) × 1 / (distance_km + 1)
//! ```
//!
//! where `rank` is the candidate's 0-based position in the semantic ordering.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::corpus::{Candidate, Corpus};
use super::embedding::{Embedding, EmbeddingService};
use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::store::{DeliveryPost, PostId, RecordStore};

/// Default semantic oversampling multiplier for geo-filtered searches.
pub const DEFAULT_OVERSAMPLE_FACTOR: usize = 5;

/// Default floor on the semantic candidate pool for geo-filtered searches.
pub const DEFAULT_MIN_CANDIDATES: usize = 100;

/// Tuning for the hybrid ranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSearchConfig {
    /// Semantic candidates fetched per requested result before geofiltering.
    pub oversample_factor: usize,
    /// Minimum semantic candidates fetched before geofiltering.
    pub min_candidates: usize,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            oversample_factor: DEFAULT_OVERSAMPLE_FACTOR,
            min_candidates: DEFAULT_MIN_CANDIDATES,
        }
    }
}

impl HybridSearchConfig {
    /// Size of the semantic candidate pool for a request of `limit` results.
    pub fn candidate_pool(&self, limit: usize) -> usize {
        limit
            .saturating_mul(self.oversample_factor)
            .max(self.min_candidates)
            .max(1)
    }
}

/// How geo-filtered candidates are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingPolicy {
    /// Multiplicative fusion of semantic rank and distance.
    Fused,
    /// Nearest first; semantic rank only decides which candidates exist.
    DistanceOnly,
}

/// A resolved post with its distance from the user and its ranking score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub post: DeliveryPost,
    pub distance_km: f64,
    pub score: f64,
}

/// `1 / (rank + 1)`, in (0, 1].
pub fn text_score(rank: usize) -> f64 {
    1.0 / (rank as f64 + 1.0)
}

/// `1 / (distance_km + 1)`, in (0, 1] for non-negative distances.
pub fn distance_score(distance_km: f64) -> f64 {
    1.0 / (distance_km.max(0.0) + 1.0)
}

/// Fused score, strictly decreasing in both rank and distance.
pub fn hybrid_score(rank: usize, distance_km: f64) -> f64 {
    text_score(rank) * distance_score(distance_km)
}

fn radius_is_usable(radius_km: f64) -> bool {
    // Also rejects NaN.
    radius_km > 0.0
}

/// Order geo-filtered candidates by `policy` and keep the best `limit`.
///
/// `ranked_ids` is the semantic ordering; posts that are not in it, lack
/// coordinates, or lie beyond `radius_km` are dropped before scoring.
pub fn rank_by_location(
    ranked_ids: &[PostId],
    posts: Vec<DeliveryPost>,
    origin: GeoPoint,
    radius_km: f64,
    limit: usize,
    policy: RankingPolicy,
) -> Vec<SearchResult> {
    if limit == 0 || !radius_is_usable(radius_km) {
        return Vec::new();
    }

    let ranks: HashMap<PostId, usize> = ranked_ids
        .iter()
        .enumerate()
        .map(|(rank, &id)| (id, rank))
        .collect();
    let mut seen = HashSet::with_capacity(posts.len());

    let mut results: Vec<SearchResult> = posts
        .into_iter()
        .filter_map(|post| {
            let rank = *ranks.get(&post.id)?;
            if !seen.insert(post.id) {
                return None;
            }
            let distance_km = origin.distance_km(&post.location()?);
            if distance_km > radius_km {
                return None;
            }
            let score = match policy {
                RankingPolicy::Fused => hybrid_score(rank, distance_km),
                RankingPolicy::DistanceOnly => distance_score(distance_km),
            };
            Some(SearchResult {
                post,
                distance_km,
                score,
            })
        })
        .collect();

    let by_distance = |a: &SearchResult, b: &SearchResult| -> Ordering {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.post.id.cmp(&b.post.id))
    };
    match policy {
        RankingPolicy::Fused => {
            results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| by_distance(a, b)))
        }
        RankingPolicy::DistanceOnly => results.sort_by(by_distance),
    }
    results.truncate(limit);
    results
}

/// Semantic and hybrid search over the immutable corpus.
///
/// Holds no per-request state: the corpus is shared read-only and the only
/// mutable structure, the query embedding cache, synchronizes internally.
pub struct HybridSearch {
    corpus: Arc<Corpus>,
    embedder: Option<Arc<EmbeddingService>>,
    config: HybridSearchConfig,
}

impl HybridSearch {
    /// Create a ranker. `embedder` is `None` when the model failed to load;
    /// semantic operations then fail with [`Error::EmbeddingUnavailable`].
    ///
    /// Fails if the embedder's output dimension differs from the corpus.
    pub fn new(
        corpus: Arc<Corpus>,
        embedder: Option<Arc<EmbeddingService>>,
        config: HybridSearchConfig,
    ) -> Result<Self> {
        if let Some(embedder) = &embedder {
            if embedder.dimension() != corpus.dimension() {
                return Err(Error::CorpusLoad(format!(
                    "corpus dimension {} does not match embedding model '{}' dimension {}",
                    corpus.dimension(),
                    embedder.model_name(),
                    embedder.dimension()
                )));
            }
        }
        Ok(Self {
            corpus,
            embedder,
            config,
        })
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn config(&self) -> &HybridSearchConfig {
        &self.config
    }

    /// The query embedder, if it initialized.
    pub fn embedder(&self) -> Option<&Arc<EmbeddingService>> {
        self.embedder.as_ref()
    }

    /// Whether semantic operations can be served.
    pub fn is_available(&self) -> bool {
        self.embedder.is_some()
    }

    fn embed_query(&self, query: &str) -> Result<Embedding> {
        self.embedder
            .as_ref()
            .ok_or(Error::EmbeddingUnavailable)?
            .embed(query)
    }

    /// Semantic candidates for a non-blank query.
    fn semantic_candidates(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>> {
        let vector = self.embed_query(query)?;
        self.corpus.find_similar(&vector, top_k, None)
    }

    /// Ids ordered by descending similarity to `query`.
    ///
    /// A blank query returns nothing without touching the embedder.
    pub fn search_semantic(&self, query: &str, limit: usize) -> Result<Vec<PostId>> {
        if query.trim().is_empty() || limit == 0 {
            debug!("Blank query or zero limit, skipping semantic search");
            return Ok(Vec::new());
        }
        let candidates = self.semantic_candidates(query, limit)?;
        Ok(candidates.into_iter().map(|c| c.id).collect())
    }

    /// Semantic ranking restricted to the ids the store reports within
    /// `radius_km` of `origin`.
    pub async fn search_semantic_within(
        &self,
        store: &dyn RecordStore,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<PostId>> {
        if query.trim().is_empty() || limit == 0 || !radius_is_usable(radius_km) {
            return Ok(Vec::new());
        }
        // Surface an outage before doing any store work.
        let vector = self.embed_query(query)?;
        let allowed: HashSet<PostId> = store
            .fetch_within_radius(origin, radius_km)
            .await?
            .into_iter()
            .collect();
        debug!("{} posts within {} km of the user", allowed.len(), radius_km);
        let candidates = self.corpus.find_similar(&vector, limit, Some(&allowed))?;
        Ok(candidates.into_iter().map(|c| c.id).collect())
    }

    /// Hybrid geo + semantic search with fused scoring.
    pub async fn search_hybrid(
        &self,
        store: &dyn RecordStore,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search_near(store, query, origin, radius_km, limit, RankingPolicy::Fused)
            .await
    }

    /// Geo-filter variant: the same semantic candidates, ordered purely by
    /// distance from the user.
    pub async fn search_geo_filtered(
        &self,
        store: &dyn RecordStore,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.search_near(store, query, origin, radius_km, limit, RankingPolicy::DistanceOnly)
            .await
    }

    async fn search_near(
        &self,
        store: &dyn RecordStore,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
        policy: RankingPolicy,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() || limit == 0 || !radius_is_usable(radius_km) {
            return Ok(Vec::new());
        }

        let pool = self.config.candidate_pool(limit);
        let ranked_ids: Vec<PostId> = self
            .semantic_candidates(query, pool)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        debug!("Semantic stage returned {} candidates (pool {})", ranked_ids.len(), pool);
        if ranked_ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts = store.fetch_by_ids(&ranked_ids).await?;
        if posts.len() < ranked_ids.len() {
            debug!(
                "Record store resolved {} of {} candidates",
                posts.len(),
                ranked_ids.len()
            );
        }

        let results = rank_by_location(&ranked_ids, posts, origin, radius_km, limit, policy);
        debug!("{} results within {} km", results.len(), radius_km);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use crate::test_utils::{corpus_for, counting_service, sample_posts, VocabModel};

    const MUMBAI: GeoPoint = GeoPoint::new(19.07, 72.87);

    fn ranker() -> (HybridSearch, Arc<crate::test_utils::CountingModel<VocabModel>>) {
        let corpus = corpus_for(&sample_posts(), &VocabModel::sample());
        let (service, model) = counting_service();
        let search =
            HybridSearch::new(Arc::new(corpus), Some(service), HybridSearchConfig::default())
                .unwrap();
        (search, model)
    }

    fn post_at(id: PostId, lat: f64, lon: f64) -> DeliveryPost {
        let mut post = sample_posts().remove(0);
        post.id = id;
        post.latitude = Some(lat);
        post.longitude = Some(lon);
        post
    }

    // ================================================================
    // Scoring
    // ================================================================

    #[test]
    fn test_component_scores_in_unit_interval() {
        assert_eq!(text_score(0), 1.0);
        assert_eq!(distance_score(0.0), 1.0);
        assert!(text_score(1000) > 0.0);
        assert!(distance_score(20_000.0) > 0.0);
    }

    #[test]
    fn test_hybrid_score_monotonic() {
        // Equal rank: nearer wins.
        assert!(hybrid_score(3, 1.0) > hybrid_score(3, 2.0));
        // Equal distance: better rank wins.
        assert!(hybrid_score(0, 5.0) > hybrid_score(1, 5.0));
    }

    #[test]
    fn test_candidate_pool() {
        let config = HybridSearchConfig::default();
        assert_eq!(config.candidate_pool(10), 100);
        assert_eq!(config.candidate_pool(30), 150);
    }

    // ================================================================
    // Location ranking
    // ================================================================

    #[test]
    fn test_rank_by_location_excludes_outside_radius() {
        let posts = vec![post_at(1, 19.07, 72.87), post_at(2, 18.52, 73.85)];
        let results = rank_by_location(&[1, 2], posts, MUMBAI, 50.0, 10, RankingPolicy::Fused);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].post.id, 1);
        assert!(results[0].distance_km < 1e-6);
    }

    #[test]
    fn test_rank_by_location_drops_missing_coordinates_and_unranked() {
        let mut no_coords = post_at(1, 0.0, 0.0);
        no_coords.latitude = None;
        let unranked = post_at(9, 19.07, 72.87);
        let results = rank_by_location(
            &[1, 2],
            vec![no_coords, unranked, post_at(2, 19.08, 72.88)],
            MUMBAI,
            50.0,
            10,
            RankingPolicy::Fused,
        );
        let ids: Vec<_> = results.iter().map(|r| r.post.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_fused_ranking_uses_semantic_position() {
        // Both in radius; id 2 is nearer but ranked far worse semantically.
        let posts = vec![post_at(2, 19.071, 72.871), post_at(1, 19.08, 72.88)];
        let results = rank_by_location(&[1, 5, 6, 7, 2], posts, MUMBAI, 50.0, 10, RankingPolicy::Fused);
        let ids: Vec<_> = results.iter().map(|r| r.post.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_distance_only_ranking() {
        let posts = vec![post_at(2, 19.071, 72.871), post_at(1, 19.08, 72.88)];
        let results =
            rank_by_location(&[1, 5, 6, 7, 2], posts, MUMBAI, 50.0, 10, RankingPolicy::DistanceOnly);
        let ids: Vec<_> = results.iter().map(|r| r.post.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_equal_scores_break_ties_by_distance_then_id() {
        let posts = vec![post_at(8, 19.07, 72.87), post_at(4, 19.07, 72.87)];
        let results = rank_by_location(&[8, 4], posts, MUMBAI, 50.0, 10, RankingPolicy::DistanceOnly);
        let ids: Vec<_> = results.iter().map(|r| r.post.id).collect();
        assert_eq!(ids, vec![4, 8]);
    }

    #[test]
    fn test_rank_by_location_truncates_and_rejects_bad_radius() {
        let posts = || vec![post_at(1, 19.07, 72.87), post_at(2, 19.08, 72.88)];
        assert_eq!(
            rank_by_location(&[1, 2], posts(), MUMBAI, 50.0, 1, RankingPolicy::Fused).len(),
            1
        );
        assert!(rank_by_location(&[1, 2], posts(), MUMBAI, 0.0, 5, RankingPolicy::Fused).is_empty());
        assert!(rank_by_location(&[1, 2], posts(), MUMBAI, -3.0, 5, RankingPolicy::Fused).is_empty());
    }

    // ================================================================
    // Search operations
    // ================================================================

    #[test]
    fn test_search_semantic_ranks_matching_office_first() {
        let (search, _) = ranker();
        let ids = search.search_semantic("Mumbai", 3).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(search.search_semantic("Delhi GPO", 1).unwrap(), vec![3]);
    }

    #[test]
    fn test_search_semantic_is_deterministic() {
        let (search, _) = ranker();
        let first = search.search_semantic("Pune", 3).unwrap();
        for _ in 0..5 {
            assert_eq!(search.search_semantic("Pune", 3).unwrap(), first);
        }
    }

    #[test]
    fn test_blank_query_skips_embedder() {
        let (search, model) = ranker();
        assert!(search.search_semantic("", 5).unwrap().is_empty());
        assert!(search.search_semantic("   ", 5).unwrap().is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn test_unavailable_embedder() {
        let corpus = corpus_for(&sample_posts(), &VocabModel::sample());
        let search = HybridSearch::new(Arc::new(corpus), None, HybridSearchConfig::default()).unwrap();
        assert!(!search.is_available());
        assert!(matches!(
            search.search_semantic("Mumbai", 5),
            Err(Error::EmbeddingUnavailable)
        ));
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let corpus = Corpus::from_entries(vec![(1, vec![1.0, 0.0])]).unwrap();
        let (service, _) = counting_service();
        let result = HybridSearch::new(Arc::new(corpus), Some(service), HybridSearchConfig::default());
        assert!(matches!(result, Err(Error::CorpusLoad(_))));
    }

    #[tokio::test]
    async fn test_search_hybrid_scenario() {
        let (search, _) = ranker();
        let store = InMemoryRecordStore::from_posts(sample_posts());
        let results = search
            .search_hybrid(&store, "Mumbai", MUMBAI, 50.0, 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].post.id, 1);
        assert!(results[0].distance_km < 1e-6);
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_search_hybrid_never_exceeds_radius() {
        let (search, _) = ranker();
        let store = InMemoryRecordStore::from_posts(sample_posts());
        for radius in [10.0, 130.0, 2000.0] {
            let results = search
                .search_hybrid(&store, "GPO", MUMBAI, radius, 10)
                .await
                .unwrap();
            assert!(results.iter().all(|r| r.distance_km <= radius));
        }
    }

    #[tokio::test]
    async fn test_search_semantic_within_radius() {
        let (search, _) = ranker();
        let store = InMemoryRecordStore::from_posts(sample_posts());
        let ids = search
            .search_semantic_within(&store, "Delhi", MUMBAI, 200.0, 5)
            .await
            .unwrap();
        // Delhi is out of range; the nearby offices remain in semantic order.
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_non_positive_radius_yields_empty() {
        let (search, model) = ranker();
        let store = InMemoryRecordStore::from_posts(sample_posts());
        assert!(search
            .search_hybrid(&store, "Mumbai", MUMBAI, 0.0, 5)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(model.calls(), 0);
    }
}
