//! Endpoint operations: ranker, record store and response cache composed.
//!
//! Each public method is one client-facing operation. The cache key for an
//! operation is built from its endpoint prefix, the operation name and the
//! request parameters; failures are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheKey, CacheStats, ResponseCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::search::{rank_by_location, HybridSearch, RankingPolicy, SearchResult};
use crate::store::{DeliveryPost, PostId, RecordStore, StoreStats};

/// Result body of a full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextResponse {
    pub query: String,
    pub count: usize,
    pub results: Vec<DeliveryPost>,
}

/// Distinct state names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatesResponse {
    pub states: Vec<String>,
}

/// Distinct district names within one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictsResponse {
    pub districts: Vec<String>,
}

/// Compact record used by district listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictPost {
    pub id: PostId,
    pub name: String,
    pub pincode: Option<u32>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl From<DeliveryPost> for DistrictPost {
    fn from(post: DeliveryPost) -> Self {
        Self {
            id: post.id,
            name: post.office_name,
            pincode: post.pincode,
            district: post.district,
            state: post.state_name,
            latitude: post.latitude,
            longitude: post.longitude,
        }
    }
}

/// One page of a district listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictPosts {
    pub posts: Vec<DistrictPost>,
    pub count: usize,
}

/// Parse a 6-digit Indian postal code.
pub fn parse_pincode(raw: &str) -> Result<u32> {
    let raw = raw.trim();
    if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidArgument(format!(
            "pincode must be exactly 6 digits, got '{}'",
            raw
        )));
    }
    raw.parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid pincode '{}'", raw)))
}

/// Put `posts` in the order of `ranked_ids`, dropping ids the store did not
/// resolve.
fn order_by_rank(ranked_ids: &[PostId], posts: Vec<DeliveryPost>) -> Vec<DeliveryPost> {
    let mut by_id: HashMap<PostId, DeliveryPost> =
        posts.into_iter().map(|post| (post.id, post)).collect();
    let ordered: Vec<DeliveryPost> = ranked_ids
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect();
    if ordered.len() < ranked_ids.len() {
        debug!(
            "{} ranked ids had no record and were dropped",
            ranked_ids.len() - ordered.len()
        );
    }
    ordered
}

async fn timed<T, Fut>(operation: &'static str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = fut.await;
    metrics::histogram!("dpo_search_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
    if result.is_err() {
        metrics::counter!("dpo_search_errors_total", "operation" => operation).increment(1);
    }
    result
}

/// The delivery post search service.
pub struct PostSearchService {
    search: HybridSearch,
    store: Arc<dyn RecordStore>,
    cache: ResponseCache,
    cache_config: CacheConfig,
}

impl PostSearchService {
    pub fn new(
        search: HybridSearch,
        store: Arc<dyn RecordStore>,
        cache: ResponseCache,
        cache_config: CacheConfig,
    ) -> Self {
        Self {
            search,
            store,
            cache,
            cache_config,
        }
    }

    pub fn search(&self) -> &HybridSearch {
        &self.search
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Whether the embedding model is loaded.
    pub fn is_semantic_available(&self) -> bool {
        self.search.is_available()
    }

    /// Posts ordered by semantic similarity to `query`.
    pub async fn semantic_search(&self, query: &str, limit: usize) -> Result<Vec<DeliveryPost>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let endpoint = &self.cache_config.semantic;
        let key = CacheKey::new(&endpoint.prefix, "semantic_search")
            .param("q", query)
            .param("limit", limit)
            .to_string();

        timed("semantic", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let ranked_ids = self.search.search_semantic(query, limit)?;
                    if ranked_ids.is_empty() {
                        return Ok(Vec::new());
                    }
                    let posts = self.store.fetch_by_ids(&ranked_ids).await?;
                    Ok(order_by_rank(&ranked_ids, posts))
                })
                .await
        })
        .await
    }

    /// Semantic ranking restricted to posts within `radius_km` of `origin`.
    ///
    /// Unlike [`hybrid_search`](Self::hybrid_search) the order is pure
    /// similarity; distance only decides membership.
    pub async fn semantic_search_within(
        &self,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<DeliveryPost>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 || !(radius_km > 0.0) {
            return Ok(Vec::new());
        }
        let endpoint = &self.cache_config.semantic;
        let key = CacheKey::new(&endpoint.prefix, "semantic_search_within")
            .param("q", query)
            .param("lat", origin.lat)
            .param("lon", origin.lon)
            .param("radius_km", radius_km)
            .param("limit", limit)
            .to_string();

        timed("semantic_within", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let ranked_ids = self
                        .search
                        .search_semantic_within(self.store.as_ref(), query, origin, radius_km, limit)
                        .await?;
                    if ranked_ids.is_empty() {
                        return Ok(Vec::new());
                    }
                    let posts = self.store.fetch_by_ids(&ranked_ids).await?;
                    Ok(order_by_rank(&ranked_ids, posts))
                })
                .await
        })
        .await
    }

    /// Semantic candidates near the user, scored by rank and distance.
    pub async fn hybrid_search(
        &self,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.near_search("hybrid_search", query, origin, radius_km, limit, RankingPolicy::Fused)
            .await
    }

    /// Semantic candidates near the user, nearest first.
    pub async fn geo_search(
        &self,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        self.near_search("geo_search", query, origin, radius_km, limit, RankingPolicy::DistanceOnly)
            .await
    }

    async fn near_search(
        &self,
        operation: &'static str,
        query: &str,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
        policy: RankingPolicy,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 || !(radius_km > 0.0) {
            return Ok(Vec::new());
        }
        let endpoint = &self.cache_config.hybrid;
        let key = CacheKey::new(&endpoint.prefix, operation)
            .param("q", query)
            .param("lat", origin.lat)
            .param("lon", origin.lon)
            .param("radius_km", radius_km)
            .param("limit", limit)
            .to_string();

        timed(operation, async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let store = self.store.as_ref();
                    match policy {
                        RankingPolicy::Fused => {
                            self.search
                                .search_hybrid(store, query, origin, radius_km, limit)
                                .await
                        }
                        RankingPolicy::DistanceOnly => {
                            self.search
                                .search_geo_filtered(store, query, origin, radius_km, limit)
                                .await
                        }
                    }
                })
                .await
        })
        .await
    }

    /// Every post within `radius_km` of `origin`, nearest first. No query.
    pub async fn nearby(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        if limit == 0 || !(radius_km > 0.0) {
            return Ok(Vec::new());
        }
        let endpoint = &self.cache_config.nearby;
        let key = CacheKey::new(&endpoint.prefix, "nearby")
            .param("lat", origin.lat)
            .param("lon", origin.lon)
            .param("radius_km", radius_km)
            .param("limit", limit)
            .to_string();

        timed("nearby", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let ids = self.store.fetch_within_radius(origin, radius_km).await?;
                    if ids.is_empty() {
                        return Ok(Vec::new());
                    }
                    let posts = self.store.fetch_by_ids(&ids).await?;
                    Ok(rank_by_location(
                        &ids,
                        posts,
                        origin,
                        radius_km,
                        limit,
                        RankingPolicy::DistanceOnly,
                    ))
                })
                .await
        })
        .await
    }

    /// Non-semantic text match. Works without the embedding model.
    pub async fn fulltext(&self, query: &str, limit: usize) -> Result<FulltextResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".to_string()));
        }
        let endpoint = &self.cache_config.fulltext;
        let key = CacheKey::new(&endpoint.prefix, "fulltext")
            .param("q", query)
            .param("limit", limit)
            .to_string();

        timed("fulltext", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let results = self.store.fetch_by_prefix(query, limit).await?;
                    Ok(FulltextResponse {
                        query: query.to_string(),
                        count: results.len(),
                        results,
                    })
                })
                .await
        })
        .await
    }

    /// The post registered for a 6-digit pincode.
    pub async fn by_pincode(&self, pincode: &str) -> Result<DeliveryPost> {
        let pincode = parse_pincode(pincode)?;
        let endpoint = &self.cache_config.pincode;
        let key = CacheKey::new(&endpoint.prefix, "by_pincode")
            .param("pincode", pincode)
            .to_string();

        timed("pincode", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    self.store
                        .fetch_by_pincode(pincode)
                        .await?
                        .ok_or_else(|| Error::NotFound(format!("pincode {:06}", pincode)))
                })
                .await
        })
        .await
    }

    /// A page of records in storage order.
    pub async fn list_posts(&self, skip: usize, limit: usize) -> Result<Vec<DeliveryPost>> {
        debug!("Listing posts: skip {}, limit {}", skip, limit);
        timed("list", self.store.list(skip, limit)).await
    }

    /// Aggregate record counts.
    pub async fn store_stats(&self) -> Result<StoreStats> {
        timed("stats", self.store.stats()).await
    }

    /// Every distinct state name.
    pub async fn states(&self) -> Result<StatesResponse> {
        let endpoint = &self.cache_config.states;
        let key = CacheKey::new(&endpoint.prefix, "states").to_string();

        timed("states", async {
            self.cache
                .get_or_compute(&key, endpoint.ttl(), move || async move {
                    let states = self.store.states().await?;
                    Ok(StatesResponse { states })
                })
                .await
        })
        .await
    }

    /// Districts of `state`; an unknown state has none.
    pub async fn districts(&self, state: &str) -> Result<DistrictsResponse> {
        let districts = timed("districts", self.store.districts(state.trim())).await?;
        Ok(DistrictsResponse { districts })
    }

    /// A page of the offices in `district`.
    pub async fn posts_by_district(
        &self,
        district: &str,
        skip: usize,
        limit: usize,
    ) -> Result<DistrictPosts> {
        let posts = timed(
            "district_posts",
            self.store.fetch_by_district(district.trim(), skip, limit),
        )
        .await?;
        let posts: Vec<DistrictPost> = posts.into_iter().map(DistrictPost::from).collect();
        Ok(DistrictPosts {
            count: posts.len(),
            posts,
        })
    }

    /// Drop cached responses whose keys match a glob `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Forget every memoized query embedding.
    pub fn clear_embedding_cache(&self) {
        if let Some(embedder) = self.search.embedder() {
            embedder.clear_cache();
        }
    }
}
