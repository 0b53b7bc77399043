use archivist_core::{
    load_known_names, save_known_names, Answer, CharacterNgramEmbedder, ChunkingConfig, Embedder,
    ExifTool, HitUnit, IngestionConfig, IngestionCoordinator, IngestionReport, ModelConfig,
    OpenAiChatModel, OpenAiEmbedder, OpenSearchRecordStore, PipelineConfig, QdrantVectorStore,
    QueryEngine, QueryFilters, RankedHit, RecordStore, RetrievalConfig, SearchError, SearchMode,
    SearchOutput, VectorStore, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_MODEL_ENDPOINT,
};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "archivist", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenAI-compatible model server base URL
    #[arg(long, env = "ARCHIVIST_MODEL_ENDPOINT", default_value = DEFAULT_MODEL_ENDPOINT)]
    model_endpoint: String,

    /// Chat model used for extraction and answers
    #[arg(long, env = "ARCHIVIST_MODEL", default_value = "local-model")]
    model: String,

    /// Per-request model timeout in seconds
    #[arg(long, env = "ARCHIVIST_MODEL_TIMEOUT", default_value = "120")]
    model_timeout_secs: u64,

    /// Where embeddings come from
    #[arg(long, env = "ARCHIVIST_EMBEDDER", value_enum, default_value_t = EmbedderKind::Ngram)]
    embedder: EmbedderKind,

    /// Embedding model served by the model endpoint
    #[arg(long, env = "ARCHIVIST_EMBEDDING_MODEL", default_value = "local-embedding")]
    embedding_model: String,

    /// Embedding vector length; must match the vector collection
    #[arg(long, env = "ARCHIVIST_EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// OpenSearch base URL
    #[arg(long, env = "ARCHIVIST_OPENSEARCH_URL", default_value = "http://localhost:9200")]
    opensearch_url: String,

    /// OpenSearch index holding document records
    #[arg(long, env = "ARCHIVIST_OPENSEARCH_INDEX", default_value = "archivist_documents")]
    opensearch_index: String,

    /// Qdrant base URL
    #[arg(long, env = "ARCHIVIST_QDRANT_URL", default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection holding chunk embeddings
    #[arg(long, env = "ARCHIVIST_QDRANT_COLLECTION", default_value = "archivist_chunks")]
    qdrant_collection: String,

    /// Store request timeout in seconds
    #[arg(long, env = "ARCHIVIST_STORE_TIMEOUT", default_value = "30")]
    store_timeout_secs: u64,

    /// Maximum characters per chunk
    #[arg(long, env = "ARCHIVIST_CHUNK_SIZE", default_value = "500")]
    chunk_size: usize,

    /// Fraction of a chunk repeated at the start of the next one
    #[arg(long, env = "ARCHIVIST_CHUNK_OVERLAP", default_value = "0.1")]
    chunk_overlap: f32,

    /// Files processed concurrently during ingestion
    #[arg(long, env = "ARCHIVIST_WORKERS", default_value = "4")]
    workers: usize,

    /// Skip ExifTool even when it is installed
    #[arg(long, default_value_t = false)]
    no_exiftool: bool,

    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbedderKind {
    /// Deterministic character n-gram hashing, no server needed
    Ngram,
    /// The `/embeddings` route of the model endpoint
    Endpoint,
}

#[derive(Args, Default)]
struct FilterArgs {
    #[arg(long)]
    document_set: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    entity: Option<String>,
    #[arg(long)]
    path_prefix: Option<String>,
    /// Earliest document date (YYYY-MM-DD)
    #[arg(long)]
    date_from: Option<NaiveDate>,
    /// Latest document date (YYYY-MM-DD)
    #[arg(long)]
    date_to: Option<NaiveDate>,
}

impl FilterArgs {
    fn into_filters(self) -> QueryFilters {
        QueryFilters {
            document_set: self.document_set,
            category: self.category,
            entity: self.entity,
            path_prefix: self.path_prefix,
            date_from: self.date_from,
            date_to: self.date_to,
            ..QueryFilters::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder recursively into both stores.
    Ingest {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Lexical, semantic or hybrid search.
    Search {
        #[arg(long)]
        query: String,
        /// lexical | semantic | hybrid
        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,
        #[arg(long, default_value = "10")]
        top_k: usize,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Answer a question from retrieved passages with citations.
    Ask {
        #[arg(long)]
        query: String,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// List ingested documents, newest first.
    Browse {
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        per_page: usize,
    },
    /// Remove every document under a folder from both stores.
    Forget {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Empty both stores.
    Clear,
    /// Show or replace a folder's list of known correct names.
    Names {
        #[arg(long)]
        folder: PathBuf,
        /// File whose contents become the new list
        #[arg(long)]
        set: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = pipeline_config(&cli);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        model_endpoint = %config.model.endpoint,
        "archivist boot"
    );

    if let Command::Names { folder, set } = &cli.command {
        return names(folder, set.as_deref(), &config.ingestion).await;
    }

    let embedder: Arc<dyn Embedder> = match cli.embedder {
        EmbedderKind::Ngram => Arc::new(CharacterNgramEmbedder {
            dimensions: cli.embedding_dimensions,
        }),
        EmbedderKind::Endpoint => Arc::new(OpenAiEmbedder::new(&config.model, cli.embedding_dimensions)?),
    };
    let model = Arc::new(OpenAiChatModel::new(&config.model)?);

    let store_timeout = config.ingestion.store_timeout;
    let records = OpenSearchRecordStore::new(&cli.opensearch_url, &cli.opensearch_index, store_timeout)?;
    records.ensure_index().await?;
    let vectors = QdrantVectorStore::new(
        &cli.qdrant_url,
        &cli.qdrant_collection,
        embedder.dimensions(),
        store_timeout,
    )?;
    vectors.ensure_collection().await?;
    let records: Arc<dyn RecordStore> = Arc::new(records);
    let vectors: Arc<dyn VectorStore> = Arc::new(vectors);

    match cli.command {
        Command::Ingest { folder } => {
            let folder = tokio::fs::canonicalize(&folder).await?;
            let mut coordinator = IngestionCoordinator::new(records, vectors, model, embedder, config)?;
            if !cli.no_exiftool {
                let exiftool = ExifTool::new(coordinator.config().ingestion.tool_timeout);
                if exiftool.is_installed() {
                    coordinator = coordinator.with_technical_metadata(Arc::new(exiftool));
                } else {
                    warn!("exiftool not found on PATH, technical metadata disabled");
                }
            }

            let report = Arc::new(coordinator).ingest_directory(&folder).await?;
            print_report(&report, cli.json)?;
        }
        Command::Search {
            query,
            mode,
            top_k,
            filters,
        } => {
            let config = PipelineConfig {
                retrieval: RetrievalConfig {
                    top_k,
                    ..config.retrieval
                },
                ..config
            };
            let engine = QueryEngine::new(records, vectors, embedder, model, &config)?;
            let output = engine.search(&query, mode, &filters.into_filters()).await?;
            print_search(&output, cli.json)?;
        }
        Command::Ask { query, filters } => {
            let engine = QueryEngine::new(records, vectors, embedder, model, &config)?;
            match engine.ask(&query, &filters.into_filters()).await {
                Ok(answer) => print_answer(&answer, cli.json)?,
                Err(SearchError::SynthesisUnavailable { details, hits }) => {
                    warn!(error = %details, "answer unavailable, showing retrieved passages");
                    print_search(&SearchOutput::Ranked(hits), cli.json)?;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Command::Browse { page, per_page } => {
            let engine = QueryEngine::new(records, vectors, embedder, model, &config)?;
            let page = engine.browse(page, per_page).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                println!(
                    "page {}/{} ({} documents)",
                    page.page,
                    page.total_pages.max(1),
                    page.total
                );
                for document in &page.documents {
                    println!(
                        "{} [{}] {} ({})",
                        document.document_id, document.status, document.title, document.source_path
                    );
                }
            }
        }
        Command::Forget { folder } => {
            let folder = tokio::fs::canonicalize(&folder).await.unwrap_or(folder);
            let coordinator = IngestionCoordinator::new(records, vectors, model, embedder, config)?;
            let removed = coordinator.forget_prefix(&folder).await?;
            println!("{removed} documents removed under {}", folder.display());
        }
        Command::Clear => {
            let coordinator = IngestionCoordinator::new(records, vectors, model, embedder, config)?;
            coordinator.clear().await?;
            println!("record and vector stores cleared");
        }
        Command::Names { .. } => {}
    }

    Ok(())
}

fn pipeline_config(cli: &Cli) -> PipelineConfig {
    PipelineConfig {
        model: ModelConfig {
            endpoint: cli.model_endpoint.clone(),
            model: cli.model.clone(),
            embedding_model: cli.embedding_model.clone(),
            request_timeout: Duration::from_secs(cli.model_timeout_secs),
            ..ModelConfig::default()
        },
        chunking: ChunkingConfig::new(cli.chunk_size, cli.chunk_overlap),
        retrieval: RetrievalConfig::default(),
        ingestion: IngestionConfig {
            workers: cli.workers,
            store_timeout: Duration::from_secs(cli.store_timeout_secs),
            ..IngestionConfig::default()
        },
    }
}

async fn names(folder: &Path, set: Option<&Path>, config: &IngestionConfig) -> anyhow::Result<()> {
    if let Some(source) = set {
        let content = tokio::fs::read_to_string(source).await?;
        save_known_names(folder, &config.known_names_file, &content).await?;
        info!(folder = %folder.display(), "known names replaced");
    }

    for name in load_known_names(folder, &config.known_names_file).await? {
        println!("{name}");
    }
    Ok(())
}

fn print_report(report: &IngestionReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{} ingested, {} unchanged, {} failed, {} excluded",
        report.ingested, report.skipped, report.failed, report.excluded
    );
    for state in report.failures() {
        println!(
            "  failed: {} during {} ({})",
            state.path.display(),
            state
                .failed_stage
                .map(|stage| stage.to_string())
                .unwrap_or_default(),
            state.error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_search(output: &SearchOutput, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }

    match output {
        SearchOutput::Documents(documents) => {
            for document in documents {
                println!("{} {}", document.document_id, document.title);
                println!("  source={}", document.source_path);
                println!("  {}", document.summary);
            }
        }
        SearchOutput::Ranked(hits) => {
            for hit in hits {
                print_hit(hit);
            }
        }
    }
    if output.is_empty() {
        println!("no results");
    }
    Ok(())
}

fn print_hit(hit: &RankedHit) {
    let unit = match hit.unit {
        HitUnit::Chunk { ordinal } => format!("chunk={ordinal}"),
        HitUnit::Summary => "summary".to_string(),
    };
    println!(
        "[{:?}] score={:.4} {} document_id={} {}",
        hit.origin, hit.score, unit, hit.document_id, hit.title
    );
    println!("  source={}", hit.source_path);
    println!("  {}", hit.text);
}

fn print_answer(answer: &Answer, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(answer)?);
        return Ok(());
    }

    match &answer.answer {
        Some(text) => println!("{text}"),
        None => println!("no matching documents"),
    }
    if !answer.citations.is_empty() {
        println!();
        println!("citations:");
        for id in &answer.citations {
            let source = answer
                .hits
                .iter()
                .find(|hit| &hit.document_id == id)
                .map(|hit| hit.source_path.as_str())
                .unwrap_or_default();
            println!("  {id} {source}");
        }
    }
    Ok(())
}
