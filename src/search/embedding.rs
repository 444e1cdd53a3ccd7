//! Query embedding with a process-wide LRU memo.
//!
//! The model is frozen for the lifetime of the process, so cached vectors never
//! go stale and the cache needs no invalidation beyond capacity eviction.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fastembed::{InitOptions, TextEmbedding};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::{DEFAULT_MODEL, EMBEDDING_DIM};

/// A query vector. Shared read-only once it has been placed in the cache.
pub type Embedding = Arc<[f32]>;

/// Default number of query embeddings kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// A deterministic text → vector model.
pub trait EmbeddingModel: Send + Sync {
    /// Encode one piece of text.
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Model identifier, for logs and health output.
    fn name(&self) -> &str;
}

/// Configuration for the embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingServiceConfig {
    /// Model name (e.g. "all-MiniLM-L6-v2").
    pub model: String,
    /// Maximum number of cached query embeddings.
    pub cache_capacity: usize,
    /// Where model files are downloaded to.
    pub cache_dir: Option<PathBuf>,
    /// Show a progress bar while downloading the model.
    pub show_download_progress: bool,
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_dir: None,
            show_download_progress: true,
        }
    }
}

/// Resolve a configured model name to a fastembed model and its dimension.
fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-MiniLM-L6-v2" => Ok((M::AllMiniLML6V2, EMBEDDING_DIM)),
        "all-MiniLM-L12-v2" => Ok((M::AllMiniLML12V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        other => Err(Error::Config(format!("unsupported embedding model '{}'", other))),
    }
}

/// ONNX sentence-embedding model run locally through fastembed.
pub struct FastEmbedModel {
    model: Mutex<TextEmbedding>,
    name: String,
    dimension: usize,
}

impl FastEmbedModel {
    /// Load (downloading on first use) the configured model.
    pub fn new(config: &EmbeddingServiceConfig) -> Result<Self> {
        let (model_kind, dimension) = resolve_model(&config.model)?;
        let mut options = InitOptions::new(model_kind)
            .with_show_download_progress(config.show_download_progress);
        if let Some(dir) = &config.cache_dir {
            options = options.with_cache_dir(dir.clone());
        }
        let model = TextEmbedding::try_new(options).map_err(|e| {
            Error::Embedding(format!("failed to load model '{}': {}", config.model, e))
        })?;
        Ok(Self {
            model: Mutex::new(model),
            name: config.model.clone(),
            dimension,
        })
    }
}

impl EmbeddingModel for FastEmbedModel {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .model
            .lock()
            .map_err(|_| Error::Embedding("embedding model lock poisoned".to_string()))?;
        let mut vectors = model
            .embed(vec![text], None)
            .map_err(|e| Error::Embedding(e.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| Error::Embedding("model returned no embedding".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Embeds query text, memoizing results in a bounded LRU cache.
///
/// Concurrent misses on the same text may both run the model; the last insert
/// wins, which is harmless because the model is deterministic.
pub struct EmbeddingService {
    model: Arc<dyn EmbeddingModel>,
    cache: Mutex<LruCache<String, Embedding>>,
}

impl EmbeddingService {
    /// Load the configured fastembed model.
    pub fn new(config: EmbeddingServiceConfig) -> Result<Self> {
        info!("Loading embedding model: {}", config.model);
        let model = FastEmbedModel::new(&config)?;
        info!(
            "Embedding model ready (dim {}, query cache {})",
            model.dimension(),
            config.cache_capacity
        );
        Ok(Self::with_model(Arc::new(model), config.cache_capacity))
    }

    /// Wrap an existing model.
    pub fn with_model(model: Arc<dyn EmbeddingModel>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            model,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Embed `text` after trimming surrounding whitespace.
    ///
    /// Callers are expected to short-circuit blank queries; a blank input is
    /// rejected rather than sent to the model.
    pub fn embed(&self, text: &str) -> Result<Embedding> {
        let key = text.trim();
        if key.is_empty() {
            return Err(Error::InvalidArgument("cannot embed blank text".to_string()));
        }

        if let Some(hit) = self.lock_cache().get(key) {
            debug!("Query embedding cache hit: '{}'", key);
            return Ok(Arc::clone(hit));
        }

        // Run the model outside the lock.
        let vector = self.model.encode(key)?;
        if vector.len() != self.model.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.model.dimension(),
                actual: vector.len(),
            });
        }
        let embedding: Embedding = vector.into();
        self.lock_cache().put(key.to_string(), Arc::clone(&embedding));
        Ok(embedding)
    }

    /// Output dimension of the underlying model.
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Number of cached query embeddings.
    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    /// Drop every cached query embedding.
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
        info!("Query embedding cache cleared");
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Embedding>> {
        // The cache holds plain values; a panic mid-update cannot corrupt it.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
