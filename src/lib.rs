//! Delivery post office search.
//!
//! Semantic search over precomputed office embeddings, optionally fused with
//! great-circle distance from the user, served over HTTP with a response
//! cache in front.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod search;
pub mod service;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use api::{ApiServer, AppState};
pub use cache::{CacheBackend, CacheKey, CacheStats, MemoryCacheBackend, ResponseCache};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use geo::{haversine_km, GeoPoint};
pub use search::{
    Corpus, CorpusSnapshot, EmbeddingModel, EmbeddingService, EmbeddingServiceConfig,
    HybridSearch, HybridSearchConfig, Precision, RankingPolicy, SearchResult,
};
pub use service::{
    DistrictPost, DistrictPosts, DistrictsResponse, FulltextResponse, PostSearchService,
    StatesResponse,
};
pub use store::{DeliveryPost, InMemoryRecordStore, PostId, RecordStore, StoreStats};
