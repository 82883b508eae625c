// config.rs
// Run configuration: defaults, then an optional TOML file, then env keys, then CLI flags

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::embedder::{EmbeddingBackend, EmbeddingConfig};
use crate::error::PipelineError;
use crate::pipeline::cluster::ClusterConfig;
use crate::pipeline::ingest::IngestConfig;
use crate::pipeline::persona::{SynthesisConfig, SynthesisStrategy};

/// Everything a run needs to know
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub embedding: EmbeddingConfig,
    pub clustering: ClusterConfig,
    pub synthesis: SynthesisConfig,

    /// Abort when more than this share of comments fails to embed
    pub max_embedding_failure_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            embedding: EmbeddingConfig::default(),
            clustering: ClusterConfig::default(),
            synthesis: SynthesisConfig::default(),
            max_embedding_failure_ratio: 1.0,
        }
    }
}

impl PipelineConfig {
    /// Parse TOML. A file that does not parse is a fatal configuration error.
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::config(format!("invalid config file: {}", e)))
    }

    /// Load from a TOML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| PipelineError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Pick up API keys and endpoint overrides from the environment
    pub fn with_env(mut self) -> Self {
        self.synthesis.generation = self.synthesis.generation.with_env();
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = self.synthesis.generation.openai_api_key.clone();
        }
        if let Some(base_url) = &self.synthesis.generation.base_url {
            self.embedding.base_url = base_url.clone();
        }
        self
    }

    /// Reject configurations no run could succeed with
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let Some(code) = &self.ingest.language {
            if self.ingest.target_language().is_none() {
                return Err(PipelineError::config(format!(
                    "ingest.language {:?} is not an ISO 639-3 code (e.g. \"eng\")",
                    code
                )));
            }
        }

        let clustering = &self.clustering;
        if let Some(size) = clustering.min_cluster_size {
            if size < 2 {
                return Err(PipelineError::config(format!(
                    "clustering.min_cluster_size must be at least 2, got {}",
                    size
                )));
            }
        }
        if let Some(size) = clustering.density_min_cluster_size {
            if size < 2 {
                return Err(PipelineError::config(format!(
                    "clustering.density_min_cluster_size must be at least 2, got {}",
                    size
                )));
            }
        }
        if clustering.min_samples == Some(0) {
            return Err(PipelineError::config("clustering.min_samples must be positive"));
        }
        if !(clustering.distance_threshold.is_finite() && clustering.distance_threshold > 0.0) {
            return Err(PipelineError::config(format!(
                "clustering.distance_threshold must be positive, got {}",
                clustering.distance_threshold
            )));
        }

        let embedding = &self.embedding;
        if embedding.concurrency == 0 {
            return Err(PipelineError::config("embedding.concurrency must be positive"));
        }
        if embedding.timeout_secs == 0 {
            return Err(PipelineError::config("embedding.timeout_secs must be positive"));
        }
        if embedding.max_chars == 0 {
            return Err(PipelineError::config("embedding.max_chars must be positive"));
        }
        if embedding.dimension == Some(0) {
            return Err(PipelineError::config("embedding.dimension must be positive"));
        }
        if embedding.backend == EmbeddingBackend::OpenAi && embedding.api_key.is_none() {
            return Err(PipelineError::config(
                "openai embedding backend selected but OPENAI_API_KEY is not set",
            ));
        }

        let synthesis = &self.synthesis;
        if synthesis.concurrency == 0 {
            return Err(PipelineError::config("synthesis.concurrency must be positive"));
        }
        if synthesis.timeout_secs == 0 {
            return Err(PipelineError::config("synthesis.timeout_secs must be positive"));
        }
        if synthesis.max_supporting_comments == 0 {
            return Err(PipelineError::config(
                "synthesis.max_supporting_comments must be positive",
            ));
        }
        if synthesis.max_traits == 0 {
            return Err(PipelineError::config("synthesis.max_traits must be positive"));
        }
        let temperature = synthesis.generation.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(PipelineError::config(format!(
                "synthesis.temperature must be within [0, 2], got {}",
                temperature
            )));
        }
        if synthesis.strategy == SynthesisStrategy::Generative {
            // Explicit providers need their key; auto may resolve to nothing
            synthesis.generation.resolve()?;
        }

        if !(0.0..=1.0).contains(&self.max_embedding_failure_ratio) {
            return Err(PipelineError::config(format!(
                "max_embedding_failure_ratio must be within [0, 1], got {}",
                self.max_embedding_failure_ratio
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cluster::ClusterAlgorithm;
    use crate::pipeline::generate::GenerativeProvider;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let config = PipelineConfig::from_toml_str(
            r#"
            max_embedding_failure_ratio = 0.25

            [ingest]
            min_chars = 10
            language = "eng"

            [embedding]
            dimension = 128
            concurrency = 3

            [clustering]
            algorithm = "agglomerative"
            min_cluster_size = 4

            [synthesis]
            strategy = "generative"
            provider = "groq"
            temperature = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.ingest.min_chars, 10);
        assert_eq!(config.ingest.language.as_deref(), Some("eng"));
        assert_eq!(config.embedding.dimension, Some(128));
        assert_eq!(config.embedding.concurrency, 3);
        assert_eq!(config.embedding.max_chars, 2000);
        assert_eq!(config.clustering.algorithm, ClusterAlgorithm::Agglomerative);
        assert_eq!(config.clustering.min_cluster_size, Some(4));
        assert_eq!(config.synthesis.strategy, SynthesisStrategy::Generative);
        assert_eq!(config.synthesis.generation.provider, GenerativeProvider::Groq);
        assert_eq!(config.synthesis.generation.temperature, 0.0);
        assert_eq!(config.max_embedding_failure_ratio, 0.25);
    }

    #[test]
    fn unparseable_config_files_are_fatal() {
        let err = PipelineConfig::from_toml_str("[clustering]\nalgorithm = \"kmeans\"\n").unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfiguration(_)));

        let err = PipelineConfig::from_toml_str("[embedding\nconcurrency = ").unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfiguration(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.toml");
        fs::write(&path, "max_embedding_failure_ratio = \"high\"\n").unwrap();
        let err = PipelineConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, PipelineError::FatalConfiguration(_)));
    }

    fn rejected(mutate: impl FnOnce(&mut PipelineConfig)) -> bool {
        let mut config = PipelineConfig::default();
        mutate(&mut config);
        matches!(config.validate(), Err(PipelineError::FatalConfiguration(_)))
    }

    #[test]
    fn invalid_values_are_fatal() {
        assert!(rejected(|c| c.clustering.min_cluster_size = Some(1)));
        assert!(rejected(|c| c.clustering.density_min_cluster_size = Some(0)));
        assert!(rejected(|c| c.clustering.distance_threshold = 0.0));
        assert!(rejected(|c| c.embedding.concurrency = 0));
        assert!(rejected(|c| c.embedding.timeout_secs = 0));
        assert!(rejected(|c| c.embedding.max_chars = 0));
        assert!(rejected(|c| c.embedding.dimension = Some(0)));
        assert!(rejected(|c| c.synthesis.concurrency = 0));
        assert!(rejected(|c| c.synthesis.max_supporting_comments = 0));
        assert!(rejected(|c| c.synthesis.max_traits = 0));
        assert!(rejected(|c| c.synthesis.generation.temperature = 2.5));
        assert!(rejected(|c| c.synthesis.generation.temperature = f32::NAN));
        assert!(rejected(|c| c.max_embedding_failure_ratio = 1.5));
        assert!(rejected(|c| c.ingest.language = Some("english".to_string())));
        assert!(!rejected(|c| c.ingest.language = Some("deu".to_string())));
    }

    #[test]
    fn backends_without_keys_are_fatal() {
        assert!(rejected(|c| c.embedding.backend = EmbeddingBackend::OpenAi));
        assert!(rejected(|c| {
            c.synthesis.strategy = SynthesisStrategy::Generative;
            c.synthesis.generation.provider = GenerativeProvider::OpenAi;
        }));
        assert!(!rejected(|c| {
            c.synthesis.strategy = SynthesisStrategy::Generative;
            c.synthesis.generation.provider = GenerativeProvider::Auto;
        }));
    }

    #[test]
    fn missing_config_file_is_a_read_error() {
        let err = PipelineConfig::load(Some(Path::new("/nonexistent/persona.toml"))).unwrap_err();
        assert!(matches!(err, PipelineError::Read { .. }));
    }
}
