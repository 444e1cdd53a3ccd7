//! Request handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::cache::CacheStats;
use crate::geo::GeoPoint;
use crate::search::SearchResult;
use crate::service::{DistrictPosts, DistrictsResponse, FulltextResponse, StatesResponse};
use crate::store::{DeliveryPost, StoreStats};

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_LIST_LIMIT: usize = 20;
const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_NEARBY_RADIUS_KM: f64 = 10.0;

/// Clamp a requested result count into `[1, max]`.
pub fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

/// Validate coordinates and radius. A non-positive radius is accepted and
/// answers with an empty result further down.
fn origin_and_radius(lat: f64, lon: f64, radius_km: f64) -> Result<(GeoPoint, f64), ApiError> {
    let origin = GeoPoint::try_new(lat, lon)?;
    if !radius_km.is_finite() {
        return Err(crate::Error::InvalidArgument(format!(
            "radius_km must be a finite number, got {}",
            radius_km
        ))
        .into());
    }
    Ok((origin, radius_km))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
}

/// Semantic search, optionally restricted to a radius around `lat`/`lon`.
#[derive(Debug, Deserialize)]
pub struct SemanticSearchParams {
    pub q: String,
    pub limit: Option<usize>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub radius_km: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DistrictsParams {
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct DistrictPostsParams {
    pub district: String,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct GeoSearchParams {
    pub q: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NearbyParams {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateParams {
    /// Glob over cache keys; everything when omitted.
    pub pattern: Option<String>,
}

/// Health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Vectors in the embedding corpus.
    pub corpus_size: usize,
    /// Records in the store; `None` if the store did not answer.
    pub records: Option<usize>,
    pub semantic_search: bool,
    pub embedding_model: Option<String>,
    pub uptime: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
    /// Memoized query embeddings.
    pub embedding_cache_entries: usize,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub pattern: String,
    pub removed: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let search = state.service.search();
    let records = state.service.store().count().await.ok();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        corpus_size: search.corpus().len(),
        records,
        semantic_search: search.is_available(),
        embedding_model: search.embedder().map(|e| e.model_name().to_string()),
        uptime: state.start_time.elapsed().as_secs(),
    })
}

pub async fn semantic_search(
    State(state): State<AppState>,
    Query(params): Query<SemanticSearchParams>,
) -> ApiResult<Vec<DeliveryPost>> {
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, state.search_config.max_limit);
    let posts = match (params.lat, params.lon) {
        (None, None) => state.service.semantic_search(&params.q, limit).await?,
        (Some(lat), Some(lon)) => {
            let radius = params.radius_km.unwrap_or(state.search_config.default_radius_km);
            let (origin, radius_km) = origin_and_radius(lat, lon, radius)?;
            state
                .service
                .semantic_search_within(&params.q, origin, radius_km, limit)
                .await?
        }
        _ => {
            return Err(crate::Error::InvalidArgument(
                "lat and lon must be given together".to_string(),
            )
            .into())
        }
    };
    Ok(Json(posts))
}

pub async fn hybrid_search(
    State(state): State<AppState>,
    Query(params): Query<GeoSearchParams>,
) -> ApiResult<Vec<SearchResult>> {
    let radius = params.radius_km.unwrap_or(state.search_config.default_radius_km);
    let (origin, radius_km) = origin_and_radius(params.lat, params.lon, radius)?;
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, state.search_config.max_limit);
    let results = state
        .service
        .hybrid_search(&params.q, origin, radius_km, limit)
        .await?;
    Ok(Json(results))
}

pub async fn geo_search(
    State(state): State<AppState>,
    Query(params): Query<GeoSearchParams>,
) -> ApiResult<Vec<SearchResult>> {
    let radius = params.radius_km.unwrap_or(state.search_config.default_radius_km);
    let (origin, radius_km) = origin_and_radius(params.lat, params.lon, radius)?;
    let limit = clamp_limit(params.limit, DEFAULT_LIMIT, state.search_config.max_limit);
    let results = state
        .service
        .geo_search(&params.q, origin, radius_km, limit)
        .await?;
    Ok(Json(results))
}

pub async fn nearby(
    State(state): State<AppState>,
    Query(params): Query<NearbyParams>,
) -> ApiResult<Vec<SearchResult>> {
    let radius = params.radius_km.unwrap_or(DEFAULT_NEARBY_RADIUS_KM);
    let (origin, radius_km) = origin_and_radius(params.lat, params.lon, radius)?;
    let limit = clamp_limit(
        params.limit,
        DEFAULT_LIST_LIMIT,
        state.search_config.max_limit.saturating_mul(2),
    );
    let results = state.service.nearby(origin, radius_km, limit).await?;
    Ok(Json(results))
}

pub async fn fulltext_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<FulltextResponse> {
    let limit = clamp_limit(
        params.limit,
        DEFAULT_LIST_LIMIT,
        state.search_config.max_limit.saturating_mul(2),
    );
    let response = state.service.fulltext(&params.q, limit).await?;
    Ok(Json(response))
}

pub async fn by_pincode(
    State(state): State<AppState>,
    Path(pincode): Path<String>,
) -> ApiResult<DeliveryPost> {
    let post = state.service.by_pincode(&pincode).await?;
    Ok(Json(post))
}

pub async fn list_posts(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Vec<DeliveryPost>> {
    let limit = clamp_limit(params.limit, DEFAULT_PAGE_SIZE, state.search_config.max_page_size);
    let posts = state
        .service
        .list_posts(params.skip.unwrap_or(0), limit)
        .await?;
    Ok(Json(posts))
}

pub async fn store_stats(State(state): State<AppState>) -> ApiResult<StoreStats> {
    Ok(Json(state.service.store_stats().await?))
}

pub async fn states(State(state): State<AppState>) -> ApiResult<StatesResponse> {
    Ok(Json(state.service.states().await?))
}

pub async fn districts(
    State(state): State<AppState>,
    Query(params): Query<DistrictsParams>,
) -> ApiResult<DistrictsResponse> {
    Ok(Json(state.service.districts(&params.state).await?))
}

pub async fn district_posts(
    State(state): State<AppState>,
    Query(params): Query<DistrictPostsParams>,
) -> ApiResult<DistrictPosts> {
    let limit = clamp_limit(params.limit, DEFAULT_PAGE_SIZE, state.search_config.max_page_size);
    let page = state
        .service
        .posts_by_district(&params.district, params.skip.unwrap_or(0), limit)
        .await?;
    Ok(Json(page))
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    let stats = state.service.cache_stats().await;
    let embedding_cache_entries = state
        .service
        .search()
        .embedder()
        .map(|e| e.cache_len())
        .unwrap_or(0);
    Json(CacheStatsResponse {
        hit_rate: stats.hit_rate(),
        stats,
        embedding_cache_entries,
    })
}

pub async fn invalidate_cache(
    State(state): State<AppState>,
    Query(params): Query<InvalidateParams>,
) -> Json<InvalidateResponse> {
    let pattern = params.pattern.unwrap_or_else(|| "*".to_string());
    let removed = state.service.invalidate(&pattern).await;
    Json(InvalidateResponse { pattern, removed })
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 10, 50), 10);
        assert_eq!(clamp_limit(Some(0), 10, 50), 1);
        assert_eq!(clamp_limit(Some(500), 10, 50), 50);
        assert_eq!(clamp_limit(Some(7), 10, 50), 7);
        assert_eq!(clamp_limit(None, 20, 5), 5);
    }

    #[test]
    fn test_origin_and_radius_validation() {
        assert!(origin_and_radius(19.0, 72.8, 10.0).is_ok());
        assert!(origin_and_radius(95.0, 72.8, 10.0).is_err());
        assert!(origin_and_radius(19.0, 72.8, 0.0).is_ok());
        assert!(origin_and_radius(19.0, 72.8, -3.0).is_ok());
        assert!(origin_and_radius(19.0, 72.8, f64::NAN).is_err());
        assert!(origin_and_radius(19.0, 72.8, f64::INFINITY).is_err());
    }
}
