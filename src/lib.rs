// lib.rs
// Comments are embedded, grouped into themes and summarized into one persona per theme

pub mod config;
pub mod embedder;
pub mod error;
pub mod model;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::{BackendError, PipelineError};
pub use model::{Cluster, Comment, EmbeddedComment, Persona, PipelineResult, PipelineStage, RunMetadata};
pub use pipeline::orchestrator::{Backends, RunContext, load_result, run_from_source, run_pipeline, save_result};
