//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dpo_search::config::{ApiConfig, CacheConfig, SearchConfig};
use dpo_search::{
    Corpus, DeliveryPost, EmbeddingModel, EmbeddingService, HybridSearch, HybridSearchConfig,
    InMemoryRecordStore, MemoryCacheBackend, PostSearchService, ResponseCache, Result,
};

/// Bag-of-words embedding over a fixed vocabulary; unknown words share the
/// last dimension. Counts `encode` calls.
pub struct WordModel {
    vocab: Vec<&'static str>,
    calls: AtomicUsize,
}

impl WordModel {
    pub fn new() -> Self {
        Self {
            vocab: vec![
                "mumbai", "pune", "delhi", "gpo", "ho", "maharashtra", "central", "andheri",
            ],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingModel for WordModel {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0; self.dimension()];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let slot = self
                .vocab
                .iter()
                .position(|v| *v == word)
                .unwrap_or(self.vocab.len());
            vector[slot] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.vocab.len() + 1
    }

    fn name(&self) -> &str {
        "word-model"
    }
}

pub fn post(
    id: i64,
    name: &str,
    pincode: u32,
    district: &str,
    state: &str,
    location: Option<(f64, f64)>,
) -> DeliveryPost {
    DeliveryPost {
        id,
        office_name: name.to_string(),
        pincode: Some(pincode),
        office_type: Some("HO".to_string()),
        delivery_status: Some("Delivery".to_string()),
        division_name: None,
        region_name: None,
        circle_name: None,
        district: Some(district.to_string()),
        state_name: Some(state.to_string()),
        latitude: location.map(|(lat, _)| lat),
        longitude: location.map(|(_, lon)| lon),
    }
}

/// Mumbai, Pune and Delhi head offices plus an Andheri office with no
/// coordinates.
pub fn posts() -> Vec<DeliveryPost> {
    vec![
        post(1, "Mumbai GPO", 400001, "Mumbai", "Maharashtra", Some((19.07, 72.87))),
        post(2, "Pune HO", 411001, "Pune", "Maharashtra", Some((18.52, 73.85))),
        post(3, "Delhi GPO", 110001, "Central Delhi", "Delhi", Some((28.61, 77.21))),
        post(4, "Andheri HO", 400053, "Mumbai", "Maharashtra", None),
    ]
}

pub fn corpus(model: &dyn EmbeddingModel) -> Corpus {
    let entries = posts()
        .iter()
        .map(|p| (p.id, model.encode(&p.corpus_text()).unwrap()))
        .collect();
    Corpus::from_entries(entries).unwrap()
}

/// Everything a test needs to poke at the service.
pub struct Fixture {
    pub service: Arc<PostSearchService>,
    /// `None` when the fixture was built without a model.
    pub model: Option<Arc<WordModel>>,
}

pub fn fixture(with_model: bool) -> Fixture {
    let model = Arc::new(WordModel::new());
    let corpus = Arc::new(corpus(&WordModel::new()));
    let embedder = with_model
        .then(|| Arc::new(EmbeddingService::with_model(model.clone(), 100)));
    let search = HybridSearch::new(corpus, embedder, HybridSearchConfig::default()).unwrap();
    let store = Arc::new(InMemoryRecordStore::from_posts(posts()));
    let cache = ResponseCache::new(Arc::new(MemoryCacheBackend::default()));
    let service = PostSearchService::new(search, store, cache, CacheConfig::default());
    Fixture {
        service: Arc::new(service),
        model: with_model.then_some(model),
    }
}

/// API configuration with rate limiting off.
pub fn unlimited_api() -> ApiConfig {
    let mut config = ApiConfig::default();
    config.rate_limits.enabled = false;
    config
}

pub fn search_config() -> SearchConfig {
    SearchConfig::default()
}
