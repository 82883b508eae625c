// embedder/mod.rs
// Embedding backends: one text in, one vector out. pipeline::embed drives them.

pub mod hashing;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, PipelineError};

/// A service that maps text to a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in run metadata.
    fn model_id(&self) -> &str;

    /// Vector dimension, when the backend knows it ahead of time.
    fn dimension(&self) -> Option<usize>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

/// Which embedding backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic offline feature hashing
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint
    #[value(name = "openai")]
    OpenAi,
    /// Local ONNX sentence-transformer (requires the `onnx` feature)
    Onnx,
}

/// Configuration for the embedding stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,

    /// Model identifier; backend default when unset
    pub model: Option<String>,

    /// Expected vector dimension. Hashing uses it as its output size.
    pub dimension: Option<usize>,

    /// Texts longer than this many characters are truncated
    pub max_chars: usize,

    /// Maximum embedding calls in flight
    pub concurrency: usize,

    /// Per-call timeout
    pub timeout_secs: u64,

    /// Retries for transient failures (network, timeout)
    pub retries: usize,

    /// Base URL for the OpenAI-compatible API
    pub base_url: String,

    /// Path to ONNX model file
    pub onnx_model_path: String,

    /// Path to tokenizer JSON file
    pub onnx_tokenizer_path: String,

    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hashing,
            model: None,
            dimension: None,
            max_chars: 2000,
            concurrency: num_cpus::get().clamp(2, 8),
            timeout_secs: 30,
            retries: 1,
            base_url: "https://api.openai.com/v1".to_string(),
            onnx_model_path: "models/minilm-l6/model.onnx".to_string(),
            onnx_tokenizer_path: "models/minilm-l6/tokenizer.json".to_string(),
            api_key: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn model_or_default(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.backend {
            EmbeddingBackend::Hashing => hashing::DEFAULT_MODEL.to_string(),
            EmbeddingBackend::OpenAi => openai::DEFAULT_MODEL.to_string(),
            EmbeddingBackend::Onnx => "minilm-l6-v2".to_string(),
        }
    }
}

/// Build the provider selected by the configuration
pub fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
    match config.backend {
        EmbeddingBackend::Hashing => {
            let dimension = config.dimension.unwrap_or(hashing::DEFAULT_DIMENSION);
            Ok(Arc::new(hashing::HashingEmbedder::new(dimension)))
        }
        EmbeddingBackend::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                PipelineError::config("openai embedding backend selected but OPENAI_API_KEY is not set")
            })?;
            let embedder = openai::OpenAiEmbedder::new(
                api_key,
                config.base_url.clone(),
                config.model_or_default(),
                config.dimension,
                std::time::Duration::from_secs(config.timeout_secs),
            )?;
            Ok(Arc::new(embedder))
        }
        #[cfg(feature = "onnx")]
        EmbeddingBackend::Onnx => {
            let embedder = onnx::OnnxEmbedder::new(
                &config.onnx_model_path,
                &config.onnx_tokenizer_path,
                config.model_or_default(),
            )?;
            Ok(Arc::new(embedder))
        }
        #[cfg(not(feature = "onnx"))]
        EmbeddingBackend::Onnx => Err(PipelineError::config(
            "onnx embedding backend requires building with `--features onnx`",
        )),
    }
}

/// Scale a vector to unit length in place. Returns the original magnitude.
pub fn l2_normalize(vector: &mut [f32]) -> f32 {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in vector.iter_mut() {
            *v /= magnitude;
        }
    }
    magnitude
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        let magnitude = l2_normalize(&mut v);
        assert_eq!(magnitude, 5.0);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0; 4];
        assert_eq!(l2_normalize(&mut v), 0.0);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn onnx_without_feature_is_a_configuration_error() {
        let config = EmbeddingConfig {
            backend: EmbeddingBackend::Onnx,
            ..Default::default()
        };
        if cfg!(not(feature = "onnx")) {
            assert!(matches!(
                build_provider(&config),
                Err(PipelineError::FatalConfiguration(_))
            ));
        }
    }

    #[test]
    fn openai_backend_needs_a_key() {
        let config = EmbeddingConfig {
            backend: EmbeddingBackend::OpenAi,
            ..Default::default()
        };
        assert!(matches!(
            build_provider(&config),
            Err(PipelineError::FatalConfiguration(_))
        ));
    }
}
