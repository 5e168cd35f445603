use std::path::PathBuf;

use candle_core::Device;

use crate::{
    bert::BertEmbedder,
    embedding::{Embedder, query_instruction},
    error::Result,
    hashing::{self, FeatureHashEmbedder},
    settings::ComputeDevice,
};

pub const MODEL_ENV_VAR: &str = "DOCVAULT_MODEL";

/// Resolve the embedding model for a build, in order of priority:
/// 1. An explicit model (from --model)
/// 2. The `DOCVAULT_MODEL` environment variable
/// 3. The configured `embedding_model` setting
pub fn resolve_model_id(explicit: Option<&str>, configured: &str) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(MODEL_ENV_VAR).ok())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| configured.to_string())
}

/// Map a configured device to a candle device.
///
/// GPUs use CUDA when compiled with the `cuda` feature and Metal when
/// compiled with the `metal` feature. Anything unavailable falls back to CPU.
fn select_device(device: ComputeDevice) -> Device {
    let ComputeDevice::Gpu(ordinal) = device else {
        return Device::Cpu;
    };

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(ordinal as usize) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(ordinal as usize) {
            return device;
        }
    }

    tracing::warn!(ordinal, "GPU unavailable, running on CPU");
    Device::Cpu
}

enum Backend {
    Bert(BertEmbedder),
    Hashed(FeatureHashEmbedder),
}

impl Backend {
    fn dimension(&self) -> usize {
        match self {
            Self::Bert(model) => model.dimension(),
            Self::Hashed(model) => model.dimension(),
        }
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Bert(model) => model.embed(texts),
            Self::Hashed(model) => {
                Ok(texts.iter().map(|t| model.embed_one(t)).collect())
            }
        }
    }
}

/// Owns one embedding model and its lifecycle: lazy loading on first use,
/// explicit release afterwards.
///
/// The backend is picked from the model identity: `hashed-bow[-<dim>]`
/// selects the built-in feature-hashing embedder; anything else is treated
/// as a BERT-family model, either a local directory or a HuggingFace Hub id.
pub struct ModelManager {
    model_id: String,
    device: ComputeDevice,
    cache_dir: Option<PathBuf>,
    backend: Option<Backend>,
}

impl ModelManager {
    /// Creates a `ModelManager` with an explicit model ID. Nothing is
    /// loaded until the first embedding call.
    pub fn with_model_id(
        model_id: impl Into<String>,
        device: ComputeDevice,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            cache_dir: None,
            backend: None,
        }
    }

    /// Where hub downloads are cached.
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    fn ensure_loaded(&mut self) -> Result<&Backend> {
        if self.backend.is_none() {
            let backend = match hashing::parse_identity(&self.model_id) {
                Some(dimension) => {
                    Backend::Hashed(FeatureHashEmbedder::new(dimension?))
                }
                None => Backend::Bert(BertEmbedder::load(
                    &self.model_id,
                    select_device(self.device),
                    self.cache_dir.as_deref(),
                )?),
            };
            self.backend = Some(backend);
        }

        let backend = self.backend.as_ref().ok_or_else(|| {
            crate::error::Error::Embedding("model failed to load".into())
        })?;
        Ok(backend)
    }
}

impl Embedder for ModelManager {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&mut self) -> Result<usize> {
        Ok(self.ensure_loaded()?.dimension())
    }

    fn embed_documents(
        &mut self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let backend = self.ensure_loaded()?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            vectors.extend(backend.embed(batch)?);
        }
        Ok(vectors)
    }

    fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
        let input = match query_instruction(&self.model_id) {
            Some(instruction) => format!("{instruction}{text}"),
            None => text.to_string(),
        };
        let mut vectors = self.ensure_loaded()?.embed(&[input])?;
        vectors.pop().ok_or_else(|| {
            crate::error::Error::Embedding("model returned no vector".into())
        })
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            tracing::debug!(model = %self.model_id, "released embedding model");
        }
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_id", &self.model_id)
            .field("device", &self.device)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
