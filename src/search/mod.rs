//! Semantic and hybrid search for delivery post offices.
//!
//! Provides exact vector search fused with geographic proximity using:
//! - FastEmbed for query embedding generation (ONNX-based, lightweight)
//! - An in-memory corpus of precomputed post embeddings, scanned brute-force
//! - Haversine distance filtering against the user's position
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Query text    │────▶│ EmbeddingService│◀──── LRU query cache
//! └─────────────────┘     │   (FastEmbed)   │
//!                         └────────┬────────┘
//!                                  │
//!                                  ▼
//!                          ┌──────────────┐
//!                          │   Embedding  │
//!                          │  [f32; 384]  │
//!                          └──────┬───────┘
//!                                 │
//!                                 ▼
//!                         ┌──────────────┐      ┌──────────────┐
//!                         │    Corpus    │      │ RecordStore  │
//!                         │ exact top-k  │      │ ids → posts  │
//!                         └──────┬───────┘      └──────┬───────┘
//!                                │                     │
//!                                └──────────┬──────────┘
//!                                           ▼
//!                                   ┌──────────────┐
//!                                   │ HybridSearch │
//!                                   │ rank × dist  │
//!                                   └──────────────┘
//! ```

mod corpus;
mod embedding;
mod hybrid;

pub use corpus::{cosine_similarity, Candidate, Corpus, CorpusSnapshot, Precision};
pub use embedding::{
    Embedding, EmbeddingModel, EmbeddingService, EmbeddingServiceConfig, FastEmbedModel,
    DEFAULT_CACHE_CAPACITY,
};
pub use hybrid::{
    distance_score, hybrid_score, rank_by_location, text_score, HybridSearch, HybridSearchConfig,
    RankingPolicy, SearchResult, DEFAULT_MIN_CANDIDATES, DEFAULT_OVERSAMPLE_FACTOR,
};

/// Default embedding model (all-MiniLM-L6-v2 - 384 dimensions, good balance of speed/quality)
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Embedding dimension for the default model
pub const EMBEDDING_DIM: usize = 384;
