// pipeline/orchestrator.rs
// Drives Fetched -> Embedded -> Clustered -> Synthesized -> Assembled (or Aborted)

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::cluster::{ClusterAlgorithm, cluster_comments};
use super::embed::embed_comments;
use super::ingest::{flatten_comments, load_source};
use super::persona::{PersonaSynthesizer, synthesize_personas};
use crate::config::PipelineConfig;
use crate::embedder::{EmbeddingProvider, build_provider};
use crate::error::PipelineError;
use crate::model::{Comment, Persona, PipelineResult, PipelineStage, RunMetadata};

/// Validated configuration plus the run's cancellation token
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: PipelineConfig,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Fails with [`PipelineError::FatalConfiguration`] before anything runs
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_cancel(config, CancellationToken::new())
    }

    pub fn with_cancel(config: PipelineConfig, cancel: CancellationToken) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config, cancel })
    }
}

/// External services used by a run
pub struct Backends {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub synthesizer: PersonaSynthesizer,
}

impl Backends {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, synthesizer: PersonaSynthesizer) -> Self {
        Self { embedder, synthesizer }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self::new(
            build_provider(&config.embedding)?,
            PersonaSynthesizer::from_config(&config.synthesis)?,
        ))
    }
}

/// Stage bookkeeping for one run
struct Run {
    stage: PipelineStage,
    metadata: RunMetadata,
}

impl Run {
    fn advance(&mut self, next: PipelineStage) {
        debug_assert!(!self.stage.is_terminal());
        tracing::info!(from = ?self.stage, to = ?next, "stage complete");
        self.stage = next;
    }

    fn abort(mut self, reason: impl Into<String>) -> PipelineResult {
        let reason = reason.into();
        tracing::warn!(stage = ?self.stage, %reason, "run aborted");
        self.stage = PipelineStage::Aborted;
        self.metadata.finished_at = Some(Utc::now());
        PipelineResult {
            status: PipelineStage::Aborted,
            abort_reason: Some(reason),
            personas: Vec::new(),
            metadata: self.metadata,
        }
    }

    fn finish(mut self, personas: Vec<Persona>) -> PipelineResult {
        self.advance(PipelineStage::Assembled);
        self.metadata.finished_at = Some(Utc::now());
        PipelineResult {
            status: self.stage,
            abort_reason: None,
            personas,
            metadata: self.metadata,
        }
    }
}

/// Run every stage over already-ingested comments.
///
/// Per-item failures are recorded in the metadata. Errors are returned only
/// for run-level failures of the clustering backend.
pub async fn run_pipeline(
    ctx: &RunContext,
    backends: &Backends,
    comments: Vec<Comment>,
) -> Result<PipelineResult, PipelineError> {
    let config = &ctx.config;
    let total = comments.len();

    let mut run = Run {
        stage: PipelineStage::Fetched,
        metadata: RunMetadata {
            total_input_comments: total,
            embedding_model: backends.embedder.model_id().to_string(),
            clustering_algorithm: match config.clustering.algorithm {
                ClusterAlgorithm::Hdbscan => "hdbscan".to_string(),
                ClusterAlgorithm::Agglomerative => "agglomerative".to_string(),
            },
            synthesis_strategy: backends.synthesizer.strategy_name(),
            started_at: Some(Utc::now()),
            ..Default::default()
        },
    };

    if ctx.cancel.is_cancelled() {
        return Ok(run.abort("cancelled before embedding"));
    }

    // Embedding
    let outcome = embed_comments(comments, Arc::clone(&backends.embedder), &config.embedding, &ctx.cancel).await;
    run.metadata.embedded_comments = outcome.embedded.len();
    run.metadata.embedding_failures = outcome.failures.len();
    run.metadata.truncated_comments = outcome.truncated;
    run.metadata.vector_dimension = outcome.dimension;
    run.metadata.failed_embeddings = outcome.failures;
    run.advance(PipelineStage::Embedded);

    if ctx.cancel.is_cancelled() {
        return Ok(run.abort("cancelled during embedding"));
    }
    if total > 0 && outcome.embedded.is_empty() {
        return Ok(run.abort(format!("all {} comments failed to embed", total)));
    }
    if total > 0 {
        let ratio = run.metadata.embedding_failures as f64 / total as f64;
        if ratio > config.max_embedding_failure_ratio {
            return Ok(run.abort(format!(
                "embedding failure ratio {:.2} exceeds limit {:.2}",
                ratio, config.max_embedding_failure_ratio
            )));
        }
    }

    // Clustering: a barrier over the complete vector set
    let embedded = outcome.embedded;
    let n = embedded.len();
    let cluster_config = config.clustering.clone();
    let (embedded, clustering) = tokio::task::spawn_blocking(move || {
        let result = cluster_comments(&embedded, &cluster_config);
        (embedded, result)
    })
    .await
    .map_err(|e| PipelineError::Clustering(format!("clustering task failed: {}", e)))?;

    let clustering = match clustering {
        Ok(clustering) => clustering,
        Err(PipelineError::InsufficientData { available, required }) => {
            tracing::warn!(available, required, "not enough comments to cluster");
            run.metadata.min_cluster_size = Some(required);
            run.metadata.notes.push(format!(
                "insufficient data: {} usable comments, at least {} needed",
                available, required
            ));
            run.advance(PipelineStage::Clustered);
            run.advance(PipelineStage::Synthesized);
            return Ok(run.finish(Vec::new()));
        }
        Err(e) => return Err(e),
    };

    run.metadata.clusters_formed = clustering.clusters.len();
    run.metadata.clusters_discarded_undersize = clustering.discarded_clusters;
    run.metadata.comments_discarded_undersize = clustering.discarded_comments;
    run.metadata.noise_comments = clustering.noise_comments;
    run.metadata.min_cluster_size = Some(clustering.params.min_cluster_size);
    tracing::info!(
        comments = n,
        clusters = clustering.clusters.len(),
        noise = clustering.noise_comments,
        discarded = clustering.discarded_clusters,
        "clustering finished"
    );
    if clustering.clusters.is_empty() {
        run.metadata
            .notes
            .push("no cluster reached the minimum size".to_string());
    }
    run.advance(PipelineStage::Clustered);

    if ctx.cancel.is_cancelled() {
        return Ok(run.abort("cancelled after clustering"));
    }

    // Synthesis
    let outcomes = synthesize_personas(&backends.synthesizer, &clustering.clusters, &embedded, &ctx.cancel).await;
    if ctx.cancel.is_cancelled() {
        return Ok(run.abort("cancelled during persona synthesis"));
    }

    let mut personas = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        if let Some(fallback) = outcome.fallback {
            run.metadata.synthesis_fallbacks.push(fallback);
        }
        personas.push(outcome.persona);
    }
    run.metadata.synthesis_fallback_count = run.metadata.synthesis_fallbacks.len();
    run.advance(PipelineStage::Synthesized);

    Ok(run.finish(personas))
}

/// Ingest a collection artifact from disk, then run the pipeline
pub async fn run_from_source(
    ctx: &RunContext,
    backends: &Backends,
    path: &Path,
) -> Result<PipelineResult, PipelineError> {
    let source = load_source(path)?;
    let ingested = flatten_comments(&source, &ctx.config.ingest);
    let dropped = ingested.dropped();

    let mut result = run_pipeline(ctx, backends, ingested.comments).await?;
    if dropped > 0 {
        result.metadata.notes.insert(
            0,
            format!(
                "ingest dropped {} of {} raw comments ({} empty, {} short, {} duplicate, {} other language)",
                dropped,
                ingested.raw_comments,
                ingested.dropped_empty,
                ingested.dropped_short,
                ingested.dropped_duplicate,
                ingested.dropped_language
            ),
        );
    }
    Ok(result)
}

/// Write the result as pretty JSON, creating parent directories
pub fn save_result(result: &PipelineResult, path: &Path) -> Result<(), PipelineError> {
    let write_err = |source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let json = serde_json::to_string_pretty(result)?;
    fs::write(path, json).map_err(write_err)?;
    Ok(())
}

/// Read a previously saved result
pub fn load_result(path: &Path) -> Result<PipelineResult, PipelineError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
