//! Text embedding.
//!
//! [`Embedder`] is the seam between chunking and indexing: anything that maps
//! text to fixed-width vectors can sit behind it. [`HashingEmbedder`] needs no
//! weights and is fully deterministic. With the `bert` feature, hub models
//! such as `all-MiniLM-L6-v2` load through `BertEmbedder`.

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "bert")]
mod bert;
#[cfg(feature = "bert")]
pub use bert::BertEmbedder;

use crate::config::{Number, Settings};
use crate::error::EmbedError;
use crate::vector_entry::{Chunk, EmbeddedChunk};
use crate::vector_ops::{cosine_similarity, normalize_vector};

pub const HASHING_MODEL: &str = "hashing";

/// Short names accepted in place of a full hub repository id.
const KNOWN_HUB_MODELS: &[(&str, &str)] = &[
    ("all-minilm-l6-v2", "sentence-transformers/all-MiniLM-L6-v2"),
    ("all-minilm-l12-v2", "sentence-transformers/all-MiniLM-L12-v2"),
    ("gte-small", "thenlper/gte-small"),
];

pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Width of every vector this model produces.
    fn dimension(&self) -> usize;

    /// Output `i` is the embedding of `texts[i]`.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<Number>>, EmbedError>;

    fn encode_one(&self, text: &str) -> Result<Vec<Number>, EmbedError> {
        self.encode_batch(&[text])?
            .into_iter()
            .next()
            .ok_or(EmbedError::CountMismatch {
                expected: 1,
                actual: 0,
            })
    }
}

/// Feature-hashing bag of words and word pairs.
///
/// Each lower-cased unigram and adjacent bigram is hashed with SHA-256; the
/// digest picks a bucket and a sign. The result is L2-normalised, so texts
/// sharing vocabulary land close together under squared L2.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self, EmbedError> {
        if dimension == 0 {
            return Err(EmbedError::Inference(
                "embedding dimension must be > 0".to_string(),
            ));
        }
        Ok(Self { dimension })
    }

    fn embed(&self, text: &str) -> Vec<Number> {
        let mut vector = vec![0.0; self.dimension];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes());
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes());
        }

        normalize_vector(&mut vector);
        vector
    }

    fn accumulate(&self, vector: &mut [Number], feature: &[u8]) {
        let digest = Sha256::digest(feature);
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        HASHING_MODEL
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<Number>>, EmbedError> {
        Ok(texts.par_iter().map(|text| self.embed(text)).collect())
    }
}

/// Hub repository for `model`: a known short name, or any `owner/name` id.
pub fn hub_model_id(model: &str) -> Option<String> {
    let lower = model.to_ascii_lowercase();
    KNOWN_HUB_MODELS
        .iter()
        .find(|(short, _)| *short == lower)
        .map(|(_, repo)| repo.to_string())
        .or_else(|| model.contains('/').then(|| model.to_string()))
}

/// Resolve a model by name. `dimension` sizes the hashing model; hub models
/// have a fixed width.
pub fn create_embedder(model: &str, dimension: usize) -> Result<Arc<dyn Embedder>, EmbedError> {
    if model.eq_ignore_ascii_case(HASHING_MODEL) {
        return Ok(Arc::new(HashingEmbedder::new(dimension)?));
    }
    match hub_model_id(model) {
        Some(repo) => load_hub_model(&repo, dimension),
        None => Err(EmbedError::UnknownModel(model.to_string())),
    }
}

#[cfg(feature = "bert")]
fn load_hub_model(repo: &str, dimension: usize) -> Result<Arc<dyn Embedder>, EmbedError> {
    let embedder = BertEmbedder::from_hub(repo)?;
    if embedder.dimension() != dimension {
        tracing::warn!(
            "{} produces {}-dimensional vectors, ignoring configured dimension {}",
            repo,
            embedder.dimension(),
            dimension
        );
    }
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "bert"))]
fn load_hub_model(repo: &str, _dimension: usize) -> Result<Arc<dyn Embedder>, EmbedError> {
    Err(EmbedError::ModelLoad(format!(
        "{repo} needs a build with the `bert` feature"
    )))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub dimension: usize,
}

impl ModelInfo {
    pub fn of(embedder: &dyn Embedder) -> Self {
        Self {
            model_name: embedder.model_name().to_string(),
            dimension: embedder.dimension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatch {
    pub index: usize,
    pub text: String,
    pub similarity: Number,
}

/// Rank `corpus` against `query` by cosine similarity, best first, without
/// going through an index.
pub fn find_similar_texts(
    embedder: &dyn Embedder,
    query: &str,
    corpus: &[&str],
    top_k: usize,
) -> Result<Vec<TextMatch>, EmbedError> {
    let query_vector = embedder.encode_one(query)?;
    let corpus_vectors = embedder.encode_batch(corpus)?;
    if corpus_vectors.len() != corpus.len() {
        return Err(EmbedError::CountMismatch {
            expected: corpus.len(),
            actual: corpus_vectors.len(),
        });
    }

    let mut matches = corpus
        .iter()
        .zip(&corpus_vectors)
        .enumerate()
        .map(|(index, (text, vector))| {
            let similarity = cosine_similarity(&query_vector, vector).ok_or(
                EmbedError::DimensionMismatch {
                    expected: query_vector.len(),
                    actual: vector.len(),
                },
            )?;
            Ok(TextMatch {
                index,
                text: text.to_string(),
                similarity,
            })
        })
        .collect::<Result<Vec<_>, EmbedError>>()?;

    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches.truncate(top_k);
    Ok(matches)
}

pub fn embedder_from_settings(settings: &Settings) -> Result<Arc<dyn Embedder>, EmbedError> {
    create_embedder(&settings.embedding_model, settings.embedding_dimension)
}

/// Embed `chunks` in batches of `batch_size`, checking that the model returned
/// one vector of the advertised width per chunk. Nothing is returned unless
/// every chunk was embedded.
pub fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<Chunk>,
    batch_size: usize,
) -> Result<Vec<EmbeddedChunk>, EmbedError> {
    let batch_size = batch_size.max(1);
    let dimension = embedder.dimension();
    let mut vectors: Vec<Vec<Number>> = Vec::with_capacity(chunks.len());

    for (n, batch) in chunks.chunks(batch_size).enumerate() {
        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let encoded = embedder.encode_batch(&texts)?;
        if encoded.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                actual: encoded.len(),
            });
        }
        if let Some(bad) = encoded.iter().find(|v| v.len() != dimension) {
            return Err(EmbedError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }
        debug!(
            "Embedded batch {} ({} texts) with {}",
            n,
            texts.len(),
            embedder.model_name()
        );
        vectors.extend(encoded);
    }

    Ok(chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| EmbeddedChunk::new(chunk, vector))
        .collect())
}
