// model/mod.rs
// Entities handed from stage to stage: comments, vectors, clusters, personas

pub mod input;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a comment
pub type CommentId = String;

/// Identifier assigned to a retained cluster
pub type ClusterId = usize;

/// A single public comment, as produced by ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub text: String,
    pub source_video_id: String,
    pub author: Option<String>,
    pub timestamp: Option<String>,

    /// Brand or competitor the comment was collected for
    pub brand: String,

    /// Business question that led to the video search
    pub question: String,
    pub video_url: Option<String>,
    pub like_count: u64,
}

/// A comment together with its embedding vector (L2 normalized)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedComment {
    pub comment: Comment,
    pub vector: Vec<f32>,
}

impl EmbeddedComment {
    pub fn id(&self) -> &str {
        &self.comment.id
    }
}

/// A thematic group of comments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: ClusterId,

    /// Members in input order; never empty
    pub member_comment_ids: Vec<CommentId>,
    pub centroid: Vec<f32>,
    pub size: usize,
    pub keywords: Vec<String>,
    pub top_brands: Vec<(String, usize)>,
    pub top_questions: Vec<(String, usize)>,
}

impl Cluster {
    pub fn contains(&self, comment_id: &str) -> bool {
        self.member_comment_ids.iter().any(|id| id == comment_id)
    }
}

/// How a persona was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMethod {
    Heuristic,
    Generative,
    /// Generative synthesis failed twice; heuristic output was used instead
    HeuristicFallback,
}

/// Optional descriptive detail attached to a persona
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub demographics: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub content_preferences: Vec<String>,
    #[serde(default)]
    pub marketing_strategy: Option<String>,
}

/// One customer archetype derived from exactly one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: String,
    pub label: String,
    pub representative_traits: Vec<String>,
    pub supporting_comment_ids: Vec<CommentId>,
    pub source_cluster_id: ClusterId,
    pub keywords: Vec<String>,
    pub profile: PersonaProfile,
    pub method: SynthesisMethod,
}

/// Pipeline states. Transitions are strictly sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetched,
    Embedded,
    Clustered,
    Synthesized,
    Assembled,
    Aborted,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Assembled | PipelineStage::Aborted)
    }
}

/// A comment that could not be embedded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingFailure {
    pub comment_id: CommentId,
    pub reason: String,
}

/// A cluster whose persona came from the heuristic fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisFallback {
    pub cluster_id: ClusterId,
    pub reason: String,
}

/// Counters and diagnostics collected over one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub total_input_comments: usize,
    pub embedded_comments: usize,
    pub embedding_failures: usize,
    pub truncated_comments: usize,
    pub clusters_formed: usize,
    pub clusters_discarded_undersize: usize,
    pub comments_discarded_undersize: usize,
    pub noise_comments: usize,
    pub synthesis_fallback_count: usize,
    pub embedding_model: String,
    pub vector_dimension: Option<usize>,
    pub clustering_algorithm: String,
    pub min_cluster_size: Option<usize>,
    pub synthesis_strategy: String,
    pub failed_embeddings: Vec<EmbeddingFailure>,
    pub synthesis_fallbacks: Vec<SynthesisFallback>,
    pub notes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The final artifact of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub status: PipelineStage,
    pub abort_reason: Option<String>,
    pub personas: Vec<Persona>,
    pub metadata: RunMetadata,
}

impl PipelineResult {
    pub fn is_aborted(&self) -> bool {
        self.status == PipelineStage::Aborted
    }
}
