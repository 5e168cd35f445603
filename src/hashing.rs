//! Feature-hashing bag-of-words embedder.
//!
//! Needs no weights and no network, so it works offline and in tests.
//! Identity: `hashed-bow` (1024 dimensions) or `hashed-bow-<dim>`.

use crate::{
    embedding::{Embedder, normalize},
    error::{Error, Result},
};

pub const IDENTITY: &str = "hashed-bow";
pub const DEFAULT_DIMENSION: usize = 1024;

/// Dimension encoded in a `hashed-bow` identity, or `None` for other models.
pub fn parse_identity(model_id: &str) -> Option<Result<usize>> {
    let rest = model_id.strip_prefix(IDENTITY)?;
    if rest.is_empty() {
        return Some(Ok(DEFAULT_DIMENSION));
    }

    let parsed = rest
        .strip_prefix('-')
        .and_then(|d| d.parse::<usize>().ok())
        .filter(|&d| d > 0)
        .ok_or_else(|| {
            Error::Config(format!(
                "invalid hashed embedder '{model_id}' (expected {IDENTITY} or {IDENTITY}-<dim>)"
            ))
        });
    Some(parsed)
}

#[derive(Debug, Clone)]
pub struct FeatureHashEmbedder {
    model_id: String,
    dimension: usize,
}

impl FeatureHashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let model_id = if dimension == DEFAULT_DIMENSION {
            IDENTITY.to_string()
        } else {
            format!("{IDENTITY}-{dimension}")
        };
        Self {
            model_id,
            dimension,
        }
    }

    /// Lowercased alphanumeric tokens, each hashed into a signed bucket.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            let h = u64::from_le_bytes(word);

            let bucket = (h % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl Embedder for FeatureHashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&mut self) -> Result<usize> {
        Ok(self.dimension)
    }

    fn embed_documents(
        &mut self,
        texts: &[String],
        _batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_one(text))
    }

    fn release(&mut self) {}
}
