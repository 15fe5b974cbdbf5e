//! Sentence-transformer embeddings from a BERT checkpoint, run with Candle.
//!
//! Weights, config and tokenizer come from the Hugging Face Hub (cached after
//! the first download). Token states are mean-pooled over the attention mask
//! and L2-normalised, matching how sentence-transformers serves models such
//! as `all-MiniLM-L6-v2`.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};
use tracing::{debug, info};

use super::Embedder;
use crate::config::Number;
use crate::error::EmbedError;
use crate::vector_ops::normalize_vector;

/// Longest input, in word pieces, before truncation.
const MAX_TOKENS: usize = 512;

#[derive(Deserialize)]
struct Width {
    hidden_size: usize,
}

pub struct BertEmbedder {
    model_id: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
}

impl BertEmbedder {
    /// Download (or reuse the cached copy of) `model_id` and load it.
    pub fn from_hub(model_id: &str) -> Result<Self, EmbedError> {
        info!("Loading embedding model {}", model_id);
        let api = Api::new().map_err(|e| load_error("create hub client", e))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .map_err(|e| load_error("download config.json", e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| load_error("download tokenizer.json", e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| load_error("download model.safetensors", e))?;

        Self::from_files(model_id, &config_path, &tokenizer_path, &weights_path)
    }

    /// Load a checkpoint already on disk.
    pub fn from_files(
        model_id: &str,
        config_path: &Path,
        tokenizer_path: &Path,
        weights_path: &Path,
    ) -> Result<Self, EmbedError> {
        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);

        let config_json =
            fs::read_to_string(config_path).map_err(|e| load_error("read config.json", e))?;
        let config: Config =
            serde_json::from_str(&config_json).map_err(|e| load_error("parse config.json", e))?;
        let width: Width =
            serde_json::from_str(&config_json).map_err(|e| load_error("parse config.json", e))?;

        let mut tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|e| load_error("load tokenizer", e))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| load_error("configure truncation", e))?;

        // Safety: the safetensors file is only read, and the hub cache never
        // rewrites a downloaded blob in place.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device) }
            .map_err(|e| load_error("map weights", e))?;
        let model = BertModel::load(vb, &config).map_err(|e| load_error("build BERT model", e))?;

        info!(
            "Loaded {} ({} dimensions) on {:?}",
            model_id, width.hidden_size, device
        );
        Ok(Self {
            model_id: model_id.to_string(),
            model,
            tokenizer,
            device,
            dimension: width.hidden_size,
        })
    }

    fn pooled(
        &self,
        ids: Vec<u32>,
        mask: Vec<u32>,
        rows: usize,
        cols: usize,
    ) -> candle_core::Result<Vec<Vec<f32>>> {
        let input_ids = Tensor::from_vec(ids, (rows, cols), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (rows, cols), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let weights = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
        let counts = weights.sum(1)?.clamp(1e-9, f64::MAX)?;
        summed.broadcast_div(&counts)?.to_vec2::<f32>()
    }
}

impl Embedder for BertEmbedder {
    fn model_name(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<Number>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| EmbedError::Inference(format!("tokenization failed: {e}")))?;
        let cols = encodings.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut ids = Vec::with_capacity(texts.len() * cols);
        let mut mask = Vec::with_capacity(texts.len() * cols);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }
        if ids.len() != texts.len() * cols {
            return Err(EmbedError::Inference(
                "tokenizer returned ragged batch".to_string(),
            ));
        }

        let mut vectors = self
            .pooled(ids, mask, texts.len(), cols)
            .map_err(|e| EmbedError::Inference(e.to_string()))?;
        for vector in &mut vectors {
            normalize_vector(vector);
        }
        debug!("Encoded {} texts ({} tokens max)", texts.len(), cols);
        Ok(vectors)
    }
}

fn load_error(step: &str, e: impl std::fmt::Display) -> EmbedError {
    EmbedError::ModelLoad(format!("{step}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires model download
    fn test_minilm_embeddings() {
        let embedder = BertEmbedder::from_hub("sentence-transformers/all-MiniLM-L6-v2").unwrap();
        assert_eq!(embedder.dimension(), 384);

        let vectors = embedder
            .encode_batch(&["The cat sat on the mat.", "A kitten rests on a rug.", "Tax law"])
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 384));

        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }
}
