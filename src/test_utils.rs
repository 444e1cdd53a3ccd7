//! Test helpers shared by unit tests.
//!
//! Only compiled when running tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::search::{Corpus, EmbeddingModel, EmbeddingService};
use crate::store::DeliveryPost;

/// Bag-of-words model over a fixed vocabulary.
///
/// Each known lowercase token owns one dimension; everything else lands in a
/// shared trailing bucket. Texts sharing words end up close in cosine space
/// without downloading a real model, and rankings are exactly predictable.
pub struct VocabModel {
    vocab: Vec<String>,
}

impl VocabModel {
    pub fn new(words: &[&str]) -> Self {
        Self {
            vocab: words.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    /// Vocabulary covering [`sample_posts`].
    pub fn sample() -> Self {
        Self::new(&["mumbai", "pune", "delhi", "gpo", "ho", "maharashtra", "central"])
    }
}

impl EmbeddingModel for VocabModel {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; self.dimension()];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
        {
            let bucket = self
                .vocab
                .iter()
                .position(|w| *w == token)
                .unwrap_or(self.vocab.len());
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.vocab.len() + 1
    }

    fn name(&self) -> &str {
        "vocab"
    }
}

/// Wraps a model and counts `encode` calls.
pub struct CountingModel<M> {
    inner: M,
    calls: AtomicUsize,
}

impl<M> CountingModel<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<M: EmbeddingModel> EmbeddingModel for CountingModel<M> {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(text)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Mumbai, Pune and Delhi head offices.
pub fn sample_posts() -> Vec<DeliveryPost> {
    let post = |id, name: &str, pincode, district: &str, state: &str, lat, lon| DeliveryPost {
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
        latitude: Some(lat),
        longitude: Some(lon),
    };
    vec![
        post(1, "Mumbai GPO", 400001, "Mumbai", "Maharashtra", 19.07, 72.87),
        post(2, "Pune HO", 411001, "Pune", "Maharashtra", 18.52, 73.85),
        post(3, "Delhi GPO", 110001, "Central Delhi", "Delhi", 28.61, 77.21),
    ]
}

/// Embed every post's corpus text with `model`.
pub fn corpus_for(posts: &[DeliveryPost], model: &dyn EmbeddingModel) -> Corpus {
    let entries = posts
        .iter()
        .map(|p| (p.id, model.encode(&p.corpus_text()).unwrap()))
        .collect();
    Corpus::from_entries(entries).unwrap()
}

/// Counting vocabulary embedding service plus a handle on the counter.
pub fn counting_service() -> (Arc<EmbeddingService>, Arc<CountingModel<VocabModel>>) {
    let model = Arc::new(CountingModel::new(VocabModel::sample()));
    let service = Arc::new(EmbeddingService::with_model(model.clone(), 100));
    (service, model)
}
