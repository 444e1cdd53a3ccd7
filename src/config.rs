//! Service configuration.
//!
//! Stored as TOML. Every section and field has a default, so a partial file
//! (or none at all) yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::search::{
    EmbeddingServiceConfig, HybridSearchConfig, Precision, DEFAULT_MIN_CANDIDATES,
    DEFAULT_OVERSAMPLE_FACTOR,
};

/// Top-level configuration for the `dpo` service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub corpus: CorpusConfig,
    pub records: RecordsConfig,
    pub embedding: EmbeddingServiceConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub api: ApiConfig,
}

/// Precomputed embedding snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Snapshot file. `.json` is read as JSON, anything else as bincode.
    pub path: PathBuf,
    /// In-memory element type: `f32`, or `f16` for half the memory.
    pub precision: Precision,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/embeddings.bin"),
            precision: Precision::default(),
        }
    }
}

/// Delivery post records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    /// JSON array of delivery post records.
    pub path: PathBuf,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/posts.json"),
        }
    }
}

/// Ranking and request-shaping parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Semantic candidates fetched per requested result before geofiltering.
    pub oversample_factor: usize,
    /// Minimum semantic candidates fetched before geofiltering.
    pub min_candidates: usize,
    /// Largest `limit` a client may request.
    pub max_limit: usize,
    /// Radius used when a geo request omits one.
    pub default_radius_km: f64,
    /// Largest page a listing request may ask for.
    pub max_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            oversample_factor: DEFAULT_OVERSAMPLE_FACTOR,
            min_candidates: DEFAULT_MIN_CANDIDATES,
            max_limit: 50,
            default_radius_km: 50.0,
            max_page_size: 1000,
        }
    }
}

impl SearchConfig {
    /// Ranker tuning derived from this section.
    pub fn hybrid(&self) -> HybridSearchConfig {
        HybridSearchConfig {
            oversample_factor: self.oversample_factor,
            min_candidates: self.min_candidates,
        }
    }
}

/// Key prefix and lifetime for one cached endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCacheConfig {
    pub prefix: String,
    pub ttl_secs: u64,
}

impl EndpointCacheConfig {
    pub fn new(prefix: &str, ttl_secs: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            ttl_secs,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every request is computed.
    pub enabled: bool,
    /// Upper bound on stored responses.
    pub max_entries: u64,
    pub semantic: EndpointCacheConfig,
    pub hybrid: EndpointCacheConfig,
    pub nearby: EndpointCacheConfig,
    pub fulltext: EndpointCacheConfig,
    pub pincode: EndpointCacheConfig,
    /// Distinct state names; they change only when records are reloaded.
    pub states: EndpointCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: crate::cache::DEFAULT_MAX_ENTRIES,
            semantic: EndpointCacheConfig::new("search", 300),
            hybrid: EndpointCacheConfig::new("hybrid", 300),
            nearby: EndpointCacheConfig::new("nearby", 300),
            fulltext: EndpointCacheConfig::new("fulltext", 300),
            pincode: EndpointCacheConfig::new("pincode", 600),
            states: EndpointCacheConfig::new("states", 3600),
        }
    }
}

/// Requests per minute allowed for each endpoint group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Disable to serve without any limiting.
    pub enabled: bool,
    pub search: u32,
    pub hybrid: u32,
    pub nearby: u32,
    pub fulltext: u32,
    pub pincode: u32,
    /// Paginated record listing.
    pub listing: u32,
    /// Record store statistics.
    pub stats: u32,
    /// Cache statistics and invalidation.
    pub admin: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search: 30,
            hybrid: 60,
            nearby: 60,
            fulltext: 60,
            pincode: 100,
            listing: 100,
            stats: 20,
            admin: 20,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address (e.g. "0.0.0.0:8000").
    pub listen_address: String,
    /// Enable CORS.
    pub cors_enabled: bool,
    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
    pub rate_limits: RateLimitConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.search.max_limit == 0 {
            return Err(Error::Config("search.max_limit must be at least 1".to_string()));
        }
        if self.search.max_page_size == 0 {
            return Err(Error::Config(
                "search.max_page_size must be at least 1".to_string(),
            ));
        }
        if self.search.oversample_factor == 0 {
            return Err(Error::Config(
                "search.oversample_factor must be at least 1".to_string(),
            ));
        }
        if !(self.search.default_radius_km > 0.0 && self.search.default_radius_km.is_finite()) {
            return Err(Error::Config(
                "search.default_radius_km must be a positive number".to_string(),
            ));
        }
        if self.embedding.cache_capacity == 0 {
            return Err(Error::Config(
                "embedding.cache_capacity must be at least 1".to_string(),
            ));
        }
        let limits = &self.api.rate_limits;
        if limits.enabled
            && [
                limits.search,
                limits.hybrid,
                limits.nearby,
                limits.fulltext,
                limits.pincode,
                limits.listing,
                limits.stats,
                limits.admin,
            ]
            .contains(&0)
        {
            return Err(Error::Config(
                "api.rate_limits values must be at least 1 request/minute".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.embedding.model, "all-MiniLM-L6-v2");
        assert_eq!(config.embedding.cache_capacity, 1000);
        assert_eq!(config.search.max_limit, 50);
        assert_eq!(config.search.hybrid().candidate_pool(10), 100);
        assert_eq!(config.cache.semantic.prefix, "search");
        assert_eq!(config.cache.pincode.ttl(), Duration::from_secs(600));
        assert_eq!(config.api.rate_limits.search, 30);
        assert_eq!(config.api.rate_limits.stats, 20);
        assert_eq!(config.cache.states.prefix, "states");
        assert_eq!(config.cache.states.ttl(), Duration::from_secs(3600));
        assert_eq!(config.search.max_page_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dpo.toml");

        let mut config = ServiceConfig::default();
        config.api.listen_address = "127.0.0.1:9100".to_string();
        config.cache.hybrid.ttl_secs = 60;
        config.save(&path).unwrap();

        let loaded = ServiceConfig::load(&path).unwrap();
        assert_eq!(loaded.api.listen_address, "127.0.0.1:9100");
        assert_eq!(loaded.cache.hybrid.ttl_secs, 60);
        assert_eq!(loaded.cache.nearby.prefix, "nearby");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dpo.toml");
        fs::write(
            &path,
            "[search]\nmax_limit = 20\n\n[corpus]\npath = \"/srv/emb.json\"\nprecision = \"f16\"\n",
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.search.max_limit, 20);
        assert_eq!(config.search.min_candidates, 100);
        assert_eq!(config.corpus.path, PathBuf::from("/srv/emb.json"));
        assert_eq!(config.corpus.precision, Precision::F16);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dpo.toml");
        fs::write(&path, "[search]\nmax_limit = 0\n").unwrap();
        assert!(matches!(ServiceConfig::load(&path), Err(Error::Config(_))));

        fs::write(&path, "[api.rate_limits]\nsearch = 0\n").unwrap();
        assert!(matches!(ServiceConfig::load(&path), Err(Error::Config(_))));

        fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(ServiceConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ServiceConfig::load(dir.path().join("absent.toml")),
            Err(Error::Config(_))
        ));
    }
}
