//! HTTP API for the search service.
//!
//! Endpoints:
//! - `GET /`, `GET /health` - Health check
//! - `GET /posts` - Paginated record listing
//! - `GET /posts/search` - Semantic search, optionally within a radius
//! - `GET /posts/hybrid-search` - Semantic + distance fused ranking
//! - `GET /posts/geo-search` - Semantic candidates ordered by distance
//! - `GET /posts/nearby` - Posts around a point
//! - `GET /posts/fulltext-search` - Text match without embeddings
//! - `GET /posts/pincode/{pincode}` - Lookup by postal code
//! - `GET /stats` - Record store statistics
//! - `GET /locations/states/` - Distinct states
//! - `GET /locations/districts/?state=` - Districts of a state
//! - `GET /locations/posts/?district=` - Offices of a district
//! - `GET /cache/stats` - Response cache statistics
//! - `DELETE /cache` - Invalidate cached responses by key pattern
//! - `GET /metrics` - Prometheus metrics

mod error;
mod handlers;
mod rate_limit;

pub use error::{ApiError, ErrorBody};
pub use handlers::{clamp_limit, HealthResponse};
pub use rate_limit::{EndpointLimiter, RateLimits};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, MethodRouter};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ApiConfig, SearchConfig};
use crate::error::Result;
use crate::service::PostSearchService;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PostSearchService>,
    /// Request limits and defaults.
    pub search_config: SearchConfig,
    /// Prometheus exporter, when installed.
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<PostSearchService>, search_config: SearchConfig) -> Self {
        Self {
            service,
            search_config,
            metrics: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

fn limited(
    route: MethodRouter<AppState>,
    limiter: &Option<Arc<EndpointLimiter>>,
) -> MethodRouter<AppState> {
    match limiter {
        Some(limiter) => route.layer(middleware::from_fn_with_state(
            Arc::clone(limiter),
            rate_limit::enforce,
        )),
        None => route,
    }
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Build the application router.
pub fn router(state: AppState, config: &ApiConfig) -> Router {
    let limits = RateLimits::from_config(&config.rate_limits);

    let app: Router = Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/posts", limited(get(handlers::list_posts), &limits.listing))
        .route(
            "/posts/search",
            limited(get(handlers::semantic_search), &limits.search),
        )
        .route(
            "/posts/hybrid-search",
            limited(get(handlers::hybrid_search), &limits.hybrid),
        )
        .route(
            "/posts/geo-search",
            limited(get(handlers::geo_search), &limits.hybrid),
        )
        .route("/posts/nearby", limited(get(handlers::nearby), &limits.nearby))
        .route(
            "/posts/fulltext-search",
            limited(get(handlers::fulltext_search), &limits.fulltext),
        )
        .route(
            "/posts/pincode/{pincode}",
            limited(get(handlers::by_pincode), &limits.pincode),
        )
        .route("/stats", limited(get(handlers::store_stats), &limits.stats))
        .route("/locations/states", get(handlers::states))
        .route("/locations/states/", get(handlers::states))
        .route("/locations/districts", get(handlers::districts))
        .route("/locations/districts/", get(handlers::districts))
        .route("/locations/posts", get(handlers::district_posts))
        .route("/locations/posts/", get(handlers::district_posts))
        .route(
            "/cache/stats",
            limited(get(handlers::cache_stats), &limits.admin),
        )
        .route(
            "/cache",
            limited(delete(handlers::invalidate_cache), &limits.admin),
        )
        .route("/metrics", get(handlers::metrics))
        .with_state(state);

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .option_layer(config.cors_enabled.then(|| cors_layer(config)));
    app.layer(middleware)
}

/// HTTP server wrapping the router.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), &self.config)
    }

    /// Serve until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        info!("API server listening on {}", self.config.listen_address);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    warn!("Cannot listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await
                }
            }
        })
        .await?;
        Ok(())
    }
}
