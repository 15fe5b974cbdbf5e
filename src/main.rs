use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vekta_rag::embedder::{embedder_from_settings, ModelInfo};
use vekta_rag::pipeline::FanOut;
use vekta_rag::retriever::NO_RESULTS_ANSWER;
use vekta_rag::{
    build_context, DocumentProcessor, Embedder, Ingestor, JobStatus, LogStatusSink, Retriever,
    Settings, StatusBoard, StatusSink, VectorIndex,
};

const JOB_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "vekta-rag")]
#[command(version = "0.1")]
#[command(about = "Document retrieval over a persistent vector index", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, chunk, embed and index documents (.pdf, .docx, .txt)
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Index on the background pool and wait for every job
        #[arg(long)]
        background: bool,
    },
    /// Retrieve the chunks most relevant to a question
    Query {
        question: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Remove every chunk of a document
    Delete { name: String },
    Stats,
    /// List indexed documents with their chunk counts
    Documents,
    Clear,
    Config,
}

struct Services {
    settings: Settings,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
}

impl Services {
    fn open(settings: Settings) -> Result<Self> {
        let embedder = embedder_from_settings(&settings).context("Failed to create embedder")?;
        let index = VectorIndex::open(&settings.storage_path, Some(embedder.dimension()))
            .with_context(|| {
                format!(
                    "Failed to open vector index at '{}'",
                    settings.storage_path.display()
                )
            })?;
        Ok(Self {
            settings,
            embedder,
            index: Arc::new(index),
        })
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn ingest_command(services: &Services, files: &[PathBuf], background: bool) -> Result<()> {
    let processor = Arc::new(DocumentProcessor::from_settings(
        &services.settings,
        Arc::clone(&services.embedder),
    )?);
    let board = Arc::new(StatusBoard::new());
    let sinks: Vec<Arc<dyn StatusSink>> = vec![board.clone(), Arc::new(LogStatusSink)];
    let ingestor = Ingestor::new(
        processor,
        Arc::clone(&services.index),
        Arc::new(FanOut(sinks)),
        &services.settings.upload_dir,
        services.settings.max_file_size,
    );

    let mut results = Vec::new();
    let mut submitted = Vec::new();
    for path in files {
        let name = file_name_of(path);
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;

        if background {
            match ingestor.submit(bytes, &name) {
                Ok(job) => submitted.push((job, name)),
                Err(e) => results.push(serde_json::json!({
                    "file": name,
                    "status": "rejected",
                    "reason": e.to_string(),
                })),
            }
        } else {
            let status = match ingestor.ingest_now(&bytes, &name) {
                Ok(chunks) => JobStatus::Completed { chunks },
                Err(e) => JobStatus::Failed {
                    reason: e.to_string(),
                },
            };
            results.push(serde_json::json!({ "file": name, "outcome": status }));
        }
    }

    for (job, name) in submitted {
        let status = board.wait_for(job, JOB_TIMEOUT);
        results.push(serde_json::json!({ "file": name, "job": job, "outcome": status }));
    }

    let output = serde_json::json!({
        "results": results,
        "database_record_count": services.index.stats()?.total_vectors,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn query_command(services: &Services, question: &str, top_k: Option<usize>) -> Result<()> {
    let top_k = top_k.unwrap_or(services.settings.top_k);
    let retriever = Retriever::new(Arc::clone(&services.embedder), Arc::clone(&services.index))
        .min_similarity(services.settings.similarity_threshold);

    let results = retriever.answer_query(question, top_k);
    info!("Query returned {} results", results.len());
    let context = if results.is_empty() {
        NO_RESULTS_ANSWER.to_string()
    } else {
        build_context(&results)
    };

    let output = serde_json::json!({
        "query": question,
        "database_record_count": services.index.stats()?.total_vectors,
        "results": results.iter().map(|r| {
            serde_json::json!({
                "rank": r.rank,
                "similarity_score": r.similarity_score,
                "source_document": r.source_document,
                "sequence_index": r.sequence_index,
                "text": r.preview(),
            })
        }).collect::<Vec<_>>(),
        "context": context,
        "actual_results_count": results.len(),
        "requested_results_count": top_k,
    });

    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn delete_command(services: &Services, name: &str) -> Result<()> {
    let removed = services
        .index
        .delete_by_document(name)
        .with_context(|| format!("Failed to delete '{}'", name))?;
    let output = serde_json::json!({ "document": name, "removed": removed });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn stats_command(services: &Services) -> Result<()> {
    let output = serde_json::json!({
        "index": services.index.stats()?,
        "model": ModelInfo::of(services.embedder.as_ref()),
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn documents_command(services: &Services) -> Result<()> {
    println!("{}", serde_json::to_string(&services.index.documents()?)?);
    Ok(())
}

fn clear_command(services: &Services) -> Result<()> {
    services.index.clear().context("Failed to clear vector index")?;
    println!("{}", serde_json::json!({ "cleared": true }));
    Ok(())
}

fn init_tracing() {
    let verbose = env::var("VEKTA_VERBOSE")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();
    let settings = Settings::load().context("Failed to load configuration")?;

    if let Commands::Config = args.command {
        settings.print_config();
        return Ok(());
    }

    let services = Services::open(settings)?;
    match args.command {
        Commands::Ingest { files, background } => ingest_command(&services, &files, background)?,
        Commands::Query { question, top_k } => query_command(&services, &question, top_k)?,
        Commands::Delete { name } => delete_command(&services, &name)?,
        Commands::Stats => stats_command(&services)?,
        Commands::Documents => documents_command(&services)?,
        Commands::Clear => clear_command(&services)?,
        Commands::Config => services.settings.print_config(),
    }
    Ok(())
}
