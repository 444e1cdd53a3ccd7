//! In-memory embedding corpus with exact cosine top-k retrieval.
//!
//! The corpus is loaded once at startup and never mutated afterwards, so it is
//! shared between request tasks behind a plain `Arc` without any locking.
//! Retrieval is a brute-force scan over every row (or over an allowed id
//! subset); results are exact and deterministic.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use half::f16;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::PostId;

/// On-disk corpus snapshot: two aligned arrays of ids and vectors.
///
/// Produced by the offline embedding job. Files ending in `.json` are read as
/// JSON, everything else as bincode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorpusSnapshot {
    /// Name of the model that produced the vectors, if recorded.
    #[serde(default)]
    pub model: Option<String>,
    /// Vector dimension shared by every entry.
    pub dimension: usize,
    /// Record ids, aligned with `vectors`.
    pub ids: Vec<PostId>,
    /// Embedding vectors, aligned with `ids`.
    pub vectors: Vec<Vec<f32>>,
}

impl CorpusSnapshot {
    /// Read a snapshot file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::CorpusLoad(format!(
                "snapshot '{}' not found",
                path.display()
            )));
        }
        let bytes = std::fs::read(path).map_err(|e| {
            Error::CorpusLoad(format!("cannot read '{}': {}", path.display(), e))
        })?;
        if is_json(path) {
            serde_json::from_slice(&bytes).map_err(|e| {
                Error::CorpusLoad(format!("malformed JSON snapshot '{}': {}", path.display(), e))
            })
        } else {
            bincode::deserialize(&bytes).map_err(|e| {
                Error::CorpusLoad(format!("malformed snapshot '{}': {}", path.display(), e))
            })
        }
    }

    /// Write the snapshot, choosing the encoding from the file extension.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = if is_json(path) {
            serde_json::to_vec(self)?
        } else {
            bincode::serialize(self)?
        };
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// One entry of a similarity ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Record id.
    pub id: PostId,
    /// Cosine similarity to the query, in [-1, 1].
    pub similarity: f32,
}

/// Element type of the in-memory vector matrix.
///
/// | Precision | Memory | Similarity error |
/// |-----------|--------|------------------|
/// | F32       | 100%   | none             |
/// | F16       | 50%    | ~1e-3            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    F32,
    /// IEEE 754 half precision.
    F16,
}

impl Precision {
    pub fn bytes_per_value(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }
}

/// Row-major `rows × dimension` matrix in the configured precision.
#[derive(Debug)]
enum Matrix {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Matrix {
    fn with_capacity(precision: Precision, capacity: usize) -> Self {
        match precision {
            Precision::F32 => Matrix::F32(Vec::with_capacity(capacity)),
            Precision::F16 => Matrix::F16(Vec::with_capacity(capacity)),
        }
    }

    fn precision(&self) -> Precision {
        match self {
            Matrix::F32(_) => Precision::F32,
            Matrix::F16(_) => Precision::F16,
        }
    }

    fn values(&self) -> usize {
        match self {
            Matrix::F32(v) => v.len(),
            Matrix::F16(v) => v.len(),
        }
    }

    /// Append a row and return the L2 norm of the values as stored, or `None`
    /// if the row does not fit the precision.
    fn push_row(&mut self, row: &[f32]) -> Option<f64> {
        match self {
            Matrix::F32(values) => {
                values.extend_from_slice(row);
                Some(l2_norm(row))
            }
            Matrix::F16(values) => {
                let start = values.len();
                values.extend(row.iter().map(|&x| f16::from_f32(x)));
                let stored = &values[start..];
                if stored.iter().any(|x| !x.is_finite()) {
                    values.truncate(start);
                    return None;
                }
                Some(stored.iter().map(|x| x.to_f64() * x.to_f64()).sum::<f64>().sqrt())
            }
        }
    }

    fn dot_row(&self, start: usize, query: &[f32]) -> f64 {
        let end = start + query.len();
        match self {
            Matrix::F32(values) => dot(&values[start..end], query),
            Matrix::F16(values) => values[start..end]
                .iter()
                .zip(query)
                .map(|(&x, &y)| x.to_f64() * y as f64)
                .sum(),
        }
    }

    fn row_vec(&self, start: usize, dimension: usize) -> Vec<f32> {
        let end = start + dimension;
        match self {
            Matrix::F32(values) => values[start..end].to_vec(),
            Matrix::F16(values) => values[start..end].iter().map(|x| x.to_f32()).collect(),
        }
    }
}

/// Immutable corpus of (id, vector) pairs.
#[derive(Debug)]
pub struct Corpus {
    dimension: usize,
    model: Option<String>,
    ids: Vec<PostId>,
    vectors: Matrix,
    norms: Vec<f64>,
    rows: HashMap<PostId, usize>,
}

impl Corpus {
    /// Load and validate a snapshot from disk at full precision.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(path, Precision::F32)
    }

    /// Load a snapshot, holding its vectors in `precision`.
    pub fn load_with(path: impl AsRef<Path>, precision: Precision) -> Result<Self> {
        let path = path.as_ref();
        let corpus = Self::from_snapshot_with(CorpusSnapshot::read(path)?, precision)?;
        info!(
            "Loaded {} post embeddings from {} (dim {}, {:?}, {:.2} MB)",
            corpus.len(),
            path.display(),
            corpus.dimension(),
            precision,
            corpus.memory_bytes() as f64 / 1024.0 / 1024.0
        );
        Ok(corpus)
    }

    /// Build a corpus from (id, vector) pairs.
    pub fn from_entries(entries: Vec<(PostId, Vec<f32>)>) -> Result<Self> {
        let dimension = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
        let (ids, vectors) = entries.into_iter().unzip();
        Self::from_snapshot(CorpusSnapshot {
            model: None,
            dimension,
            ids,
            vectors,
        })
    }

    /// Validate a snapshot and lay its vectors out contiguously.
    pub fn from_snapshot(snapshot: CorpusSnapshot) -> Result<Self> {
        Self::from_snapshot_with(snapshot, Precision::F32)
    }

    pub fn from_snapshot_with(snapshot: CorpusSnapshot, precision: Precision) -> Result<Self> {
        let CorpusSnapshot {
            model,
            dimension,
            ids,
            vectors,
        } = snapshot;

        if ids.is_empty() {
            return Err(Error::CorpusLoad("snapshot contains no entries".to_string()));
        }
        if dimension == 0 {
            return Err(Error::CorpusLoad("snapshot dimension is zero".to_string()));
        }
        if ids.len() != vectors.len() {
            return Err(Error::CorpusLoad(format!(
                "snapshot has {} ids but {} vectors",
                ids.len(),
                vectors.len()
            )));
        }

        let mut matrix = Matrix::with_capacity(precision, ids.len() * dimension);
        let mut norms = Vec::with_capacity(ids.len());
        let mut rows = HashMap::with_capacity(ids.len());

        for (row, (id, vector)) in ids.iter().zip(vectors).enumerate() {
            if vector.len() != dimension {
                return Err(Error::CorpusLoad(format!(
                    "vector for id {} has dimension {}, expected {}",
                    id,
                    vector.len(),
                    dimension
                )));
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(Error::CorpusLoad(format!(
                    "vector for id {} contains non-finite values",
                    id
                )));
            }
            if rows.insert(*id, row).is_some() {
                return Err(Error::CorpusLoad(format!("duplicate id {}", id)));
            }
            let norm = matrix.push_row(&vector).ok_or_else(|| {
                Error::CorpusLoad(format!(
                    "vector for id {} exceeds the {:?} range",
                    id, precision
                ))
            })?;
            norms.push(norm);
        }

        Ok(Self {
            dimension,
            model,
            ids,
            vectors: matrix,
            norms,
            rows,
        })
    }

    /// Vector dimension of every entry.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Model recorded in the snapshot, if any.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether `id` is part of the corpus.
    pub fn contains(&self, id: PostId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Element type the vectors are held in.
    pub fn precision(&self) -> Precision {
        self.vectors.precision()
    }

    /// The stored vector for `id`, widened to `f32`.
    pub fn vector(&self, id: PostId) -> Option<Vec<f32>> {
        self.rows
            .get(&id)
            .map(|&row| self.vectors.row_vec(row * self.dimension, self.dimension))
    }

    /// Approximate heap size of the vector matrix.
    pub fn memory_bytes(&self) -> usize {
        self.vectors.values() * self.precision().bytes_per_value()
    }

    fn score_row(&self, row: usize, query: &[f32], query_norm: f64) -> Candidate {
        let norm = self.norms[row];
        let similarity = if norm == 0.0 || query_norm == 0.0 {
            0.0
        } else {
            (self.vectors.dot_row(row * self.dimension, query) / (norm * query_norm)) as f32
        };
        Candidate {
            id: self.ids[row],
            similarity,
        }
    }

    /// Exact top-k cosine retrieval.
    ///
    /// Returns at most `top_k` candidates ordered by descending similarity,
    /// ties broken by ascending id. With `allowed_ids`, only entries whose id
    /// is in the set are scored; an empty set (or one disjoint from the
    /// corpus) yields an empty result.
    pub fn find_similar(
        &self,
        query: &[f32],
        top_k: usize,
        allowed_ids: Option<&HashSet<PostId>>,
    ) -> Result<Vec<Candidate>> {
        if top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be at least 1".to_string()));
        }
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<Candidate> = match allowed_ids {
            Some(allowed) => allowed
                .iter()
                .filter_map(|id| self.rows.get(id))
                .map(|&row| self.score_row(row, query, query_norm))
                .collect(),
            None => (0..self.len())
                .map(|row| self.score_row(row, query, query_norm))
                .collect(),
        };

        debug!(
            "Scored {} of {} corpus entries (top_k {})",
            scored.len(),
            self.len(),
            top_k
        );

        if scored.len() > top_k {
            scored.select_nth_unstable_by(top_k - 1, ranking_order);
            scored.truncate(top_k);
        }
        scored.sort_by(ranking_order);
        Ok(scored)
    }
}

/// Descending similarity, then ascending id.
fn ranking_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.id.cmp(&b.id))
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum()
}

fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt()
}

/// Cosine similarity of two equal-length vectors.
///
/// Defined as 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (na, nb) = (l2_norm(a), l2_norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0) as f32
}
