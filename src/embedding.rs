use crate::{error::Result, settings::ComputeDevice};

/// A text embedding model.
///
/// Methods take `&mut self`: an instance serves one caller at a time and may
/// load weights lazily on first use.
pub trait Embedder {
    /// Identity recorded in collection manifests.
    fn model_id(&self) -> &str;

    /// Output dimensionality. May load the model.
    fn dimension(&mut self) -> Result<usize>;

    /// Embed passages, running inference `batch_size` texts at a time.
    fn embed_documents(
        &mut self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query, applying any model-specific instruction.
    fn embed_query(&mut self, text: &str) -> Result<Vec<f32>>;

    /// Free the model's memory. The next call loads it again.
    fn release(&mut self);
}

/// Model families and how many passages they embed per forward pass on an
/// accelerator. First substring match wins.
const BATCH_SIZES: &[(&str, usize)] = &[
    ("instructor-xl", 2),
    ("bge-large", 4),
    ("instructor-large", 4),
    ("gte-large", 4),
    ("instructor-base", 6),
    ("mpnet", 8),
    ("bge-base", 8),
    ("gte-base", 8),
    ("bge-small", 10),
    ("gte-small", 10),
    ("MiniLM", 30),
];

const DEFAULT_GPU_BATCH_SIZE: usize = 8;
const CPU_BATCH_SIZE: usize = 2;

/// # Examples
///
/// ```
/// use docvault::{embedding::batch_size_for, settings::ComputeDevice};
///
/// let gpu = ComputeDevice::Gpu(0);
/// assert_eq!(batch_size_for("BAAI/bge-small-en-v1.5", gpu), 10);
/// assert_eq!(batch_size_for("BAAI/bge-small-en-v1.5", ComputeDevice::Cpu), 2);
/// assert_eq!(batch_size_for("some/unknown-model", gpu), 8);
/// ```
pub fn batch_size_for(model_id: &str, device: ComputeDevice) -> usize {
    if device.is_cpu() {
        return CPU_BATCH_SIZE;
    }

    BATCH_SIZES
        .iter()
        .find(|(family, _)| model_id.contains(family))
        .map_or(DEFAULT_GPU_BATCH_SIZE, |(_, size)| *size)
}

const BGE_QUERY_INSTRUCTION: &str =
    "Represent this sentence for searching relevant passages: ";

/// Prefix prepended to queries (never to passages) for models trained
/// with asymmetric instructions.
pub fn query_instruction(model_id: &str) -> Option<&'static str> {
    model_id
        .to_ascii_lowercase()
        .contains("bge")
        .then_some(BGE_QUERY_INSTRUCTION)
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Map the Euclidean distance between two unit vectors to a relevance
/// score: 1 for identical vectors, 0 for orthogonal ones.
pub fn relevance_score(distance: f32) -> f32 {
    1.0 - distance / std::f32::consts::SQRT_2
}
