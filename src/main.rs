use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use persona_builder::embedder::EmbeddingBackend;
use persona_builder::pipeline::cluster::{ClusterAlgorithm, DistanceMetric};
use persona_builder::pipeline::generate::GenerativeProvider;
use persona_builder::pipeline::persona::SynthesisStrategy;
use persona_builder::{
    Backends, PipelineConfig, PipelineError, PipelineResult, RunContext, run_from_source, save_result,
};
use tracing_subscriber::EnvFilter;

/// Turn a comment collection into customer personas
#[derive(Debug, Parser)]
#[command(name = "persona-builder", version, about)]
struct Cli {
    /// Comment collection artifact (JSON)
    input: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "PERSONA_CONFIG")]
    config: Option<PathBuf>,

    /// Where to write the personas artifact
    #[arg(short, long, default_value = "output/personas.json")]
    output: PathBuf,

    #[arg(long, value_enum)]
    embedding_backend: Option<EmbeddingBackend>,

    #[arg(long)]
    embedding_model: Option<String>,

    #[arg(long)]
    dimension: Option<usize>,

    #[arg(long, value_enum)]
    algorithm: Option<ClusterAlgorithm>,

    #[arg(long, value_enum)]
    metric: Option<DistanceMetric>,

    /// Smallest cluster that becomes a persona (auto when unset)
    #[arg(long)]
    min_cluster_size: Option<usize>,

    #[arg(long, value_enum)]
    strategy: Option<SynthesisStrategy>,

    #[arg(long, value_enum)]
    provider: Option<GenerativeProvider>,

    /// Chat model for generative personas
    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    /// Drop comments shorter than this many characters
    #[arg(long)]
    min_chars: Option<usize>,

    /// Keep only comments in this ISO 639-3 language (e.g. eng)
    #[arg(long)]
    language: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(backend) = self.embedding_backend {
            config.embedding.backend = backend;
        }
        if let Some(model) = &self.embedding_model {
            config.embedding.model = Some(model.clone());
        }
        if let Some(dimension) = self.dimension {
            config.embedding.dimension = Some(dimension);
        }
        if let Some(algorithm) = self.algorithm {
            config.clustering.algorithm = algorithm;
        }
        if let Some(metric) = self.metric {
            config.clustering.metric = metric;
        }
        if let Some(size) = self.min_cluster_size {
            config.clustering.min_cluster_size = Some(size);
        }
        if let Some(strategy) = self.strategy {
            config.synthesis.strategy = strategy;
        }
        if let Some(provider) = self.provider {
            config.synthesis.generation.provider = provider;
        }
        if let Some(model) = &self.model {
            config.synthesis.generation.model = Some(model.clone());
        }
        if let Some(temperature) = self.temperature {
            config.synthesis.generation.temperature = temperature;
        }
        if let Some(min_chars) = self.min_chars {
            config.ingest.min_chars = min_chars;
        }
        if let Some(language) = &self.language {
            config.ingest.language = Some(language.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    println!("Persona Builder\n");

    match run(cli).await {
        Ok(result) if result.is_aborted() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::FatalConfiguration(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<PipelineResult> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    let config = config.with_env();

    let ctx = RunContext::new(config)?;
    let backends = Backends::from_config(&ctx.config)?;

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight calls");
            cancel.cancel();
        }
    });

    println!("Input: {}", cli.input.display());
    println!("\n🟪 Running pipeline: ingest → embed → cluster → synthesize...");
    let result = run_from_source(&ctx, &backends, &cli.input).await?;

    print_summary(&result);

    save_result(&result, &cli.output)
        .with_context(|| format!("failed to save personas to {}", cli.output.display()))?;

    if let Some(reason) = &result.abort_reason {
        println!("\n⛔ Run aborted: {}", reason);
        println!("   Partial artifact written to {}", cli.output.display());
    } else {
        println!(
            "\n✅ Wrote {} personas → {}",
            result.personas.len(),
            cli.output.display()
        );
    }

    Ok(result)
}

fn print_summary(result: &PipelineResult) {
    let meta = &result.metadata;

    println!("\n📊 Run Statistics:");
    println!("   • Input comments: {}", meta.total_input_comments);
    println!("   • Embedded: {} ({})", meta.embedded_comments, meta.embedding_model);
    println!("   • Embedding failures: {}", meta.embedding_failures);
    println!("   • Truncated: {}", meta.truncated_comments);
    println!("   • Clusters formed: {}", meta.clusters_formed);
    println!(
        "   • Discarded as undersize: {} clusters, {} comments",
        meta.clusters_discarded_undersize, meta.comments_discarded_undersize
    );
    println!("   • Noise comments: {}", meta.noise_comments);
    println!("   • Synthesis fallbacks: {}", meta.synthesis_fallback_count);

    for note in &meta.notes {
        println!("   ⚠️  {}", note);
    }

    if result.personas.is_empty() {
        return;
    }

    println!("\n👤 Personas:");
    for persona in result.personas.iter().take(10) {
        println!(
            "   • {} (cluster {}, {} supporting comments)",
            persona.label,
            persona.source_cluster_id,
            persona.supporting_comment_ids.len()
        );
        for item in persona.representative_traits.iter().take(3) {
            println!("       - {}", item);
        }
    }
    if result.personas.len() > 10 {
        println!("   ... and {} more personas", result.personas.len() - 10);
    }
}
