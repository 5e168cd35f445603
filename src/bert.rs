//! BERT-family sentence embedding models run with candle.
//!
//! Weights come from a local directory (containing `config.json`,
//! `tokenizer.json` and `model.safetensors`) or are downloaded from the
//! HuggingFace Hub. Outputs are mean-pooled over the attention mask.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config};
use serde::Deserialize;
use tokenizers::{Tokenizer, TruncationParams};

use crate::error::{Error, Result};

const DEFAULT_MAX_TOKENS: usize = 512;

/// The parts of `config.json` the pooling code needs.
#[derive(Debug, Deserialize)]
struct Shape {
    hidden_size: usize,
    max_position_embeddings: Option<usize>,
}

pub struct BertEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dimension: usize,
    max_tokens: usize,
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

fn resolve_files(model_id: &str, cache_dir: Option<&Path>) -> Result<ModelFiles> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok(ModelFiles {
            config: local.join("config.json"),
            tokenizer: local.join("tokenizer.json"),
            weights: local.join("model.safetensors"),
        });
    }

    let mut builder = hf_hub::api::sync::ApiBuilder::new();
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(dir.to_path_buf());
    }
    let api = builder
        .build()
        .map_err(|e| {
            Error::Embedding(format!("failed to create hub client: {e}"))
        })?;
    let repo = api.model(model_id.to_string());

    let fetch = |file: &str| {
        tracing::debug!(model = model_id, file, "fetching model file");
        repo.get(file).map_err(|e| {
            Error::Embedding(format!("failed to download {file}: {e}"))
        })
    };

    Ok(ModelFiles {
        config: fetch("config.json")?,
        tokenizer: fetch("tokenizer.json")?,
        weights: fetch("model.safetensors")?,
    })
}

impl BertEmbedder {
    pub fn load(
        model_id: &str,
        device: Device,
        cache_dir: Option<&Path>,
    ) -> Result<Self> {
        tracing::info!(model = model_id, "loading embedding model");
        let files = resolve_files(model_id, cache_dir)?;

        let config_str = std::fs::read_to_string(&files.config)?;
        let config: Config = serde_json::from_str(&config_str)?;
        let shape: Shape = serde_json::from_str(&config_str)?;
        let max_tokens = shape
            .max_position_embeddings
            .unwrap_or(DEFAULT_MAX_TOKENS)
            .min(DEFAULT_MAX_TOKENS);

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| {
                Error::Embedding(format!("failed to load tokenizer: {e}"))
            })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_tokens,
                ..Default::default()
            }))
            .map_err(|e| {
                Error::Embedding(format!("failed to configure tokenizer: {e}"))
            })?;

        // SAFETY: the weights file is only read, and nothing else in this
        // process writes to it while it is mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(
                &[files.weights],
                DType::F32,
                &device,
            )?
        };
        let model = BertModel::load(vb, &config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            dimension: shape.hidden_size,
            max_tokens,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed one batch. Vectors are mean-pooled but not normalized.
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::Embedding(format!("tokenization failed: {e}")))?;

        let max_len = encodings
            .iter()
            .map(|e| e.len())
            .max()
            .unwrap_or(0)
            .clamp(1, self.max_tokens);
        let batch = encodings.len();

        let mut input_ids = Vec::with_capacity(batch * max_len);
        let mut attention = Vec::with_capacity(batch * max_len);
        for encoding in &encodings {
            let ids = encoding.get_ids();
            let len = ids.len().min(max_len);
            input_ids.extend_from_slice(&ids[..len]);
            attention.extend(std::iter::repeat_n(1u32, len));
            input_ids.extend(std::iter::repeat_n(0u32, max_len - len));
            attention.extend(std::iter::repeat_n(0u32, max_len - len));
        }

        let input_ids = Tensor::from_vec(input_ids, (batch, max_len), &self.device)?;
        let attention_mask =
            Tensor::from_vec(attention, (batch, max_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let output = self.model.forward(
            &input_ids,
            &token_type_ids,
            Some(&attention_mask),
        )?;
        let pooled = mean_pool(&output, &attention_mask)?;

        Ok(pooled.to_vec2::<f32>()?)
    }
}

fn mean_pool(token_embeddings: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .unsqueeze(2)?
        .broadcast_as(token_embeddings.shape())?
        .to_dtype(DType::F32)?;
    let summed = token_embeddings.mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok(summed.div(&counts)?)
}

impl std::fmt::Debug for BertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BertEmbedder")
            .field("dimension", &self.dimension)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_directory_is_used_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let files =
            resolve_files(&tmp.path().to_string_lossy(), None).unwrap();
        assert_eq!(files.config, tmp.path().join("config.json"));
        assert_eq!(files.weights, tmp.path().join("model.safetensors"));
    }

    #[test]
    fn loading_an_incomplete_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = BertEmbedder::load(
            &tmp.path().to_string_lossy(),
            Device::Cpu,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn mean_pool_ignores_padding() {
        let tokens = Tensor::new(
            &[[[1.0f32, 2.0], [3.0, 4.0], [100.0, 100.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();

        let pooled = mean_pool(&tokens, &mask).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0]]);
    }
}
