// Pipeline module declarations
// Each stage is a separate module; the orchestrator runs them in order

pub mod ingest;       // Stage 0: Flatten the collection artifact into comments
pub mod embed;        // Stage 1: Comments -> vectors
pub mod cluster;      // Stage 2: Semantic clustering
pub mod persona;      // Stage 3: One persona per cluster
pub mod generate;     // LLM backend for generative personas
pub mod keywords;     // Term scoring shared by clustering and personas
pub mod orchestrator; // Stage machine and artifact I/O
