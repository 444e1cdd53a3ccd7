//! Delivery post search CLI
//!
//! Command-line interface for running the search service.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dpo_search::api::HealthResponse;
use dpo_search::search::FastEmbedModel;
use dpo_search::{
    ApiServer, AppState, Corpus, CorpusSnapshot, EmbeddingModel, EmbeddingService, Error,
    GeoPoint, HybridSearch, InMemoryRecordStore, MemoryCacheBackend, PostSearchService,
    RecordStore, ResponseCache, Result, ServiceConfig,
};
use metrics_exporter_prometheus::PrometheusBuilder;

#[derive(Parser)]
#[command(name = "dpo")]
#[command(author, version, about = "Delivery post office search service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dpo.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dpo.toml")]
        output: String,
    },

    /// Start the HTTP API
    Start {
        /// HTTP API listen address (overrides the configuration)
        #[arg(long)]
        api_addr: Option<String>,
    },

    /// Run one search in-process and print the results as JSON
    Query {
        /// Search text
        text: String,

        /// Number of results
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// User latitude (enables hybrid ranking together with --lon)
        #[arg(long, requires = "lon")]
        lat: Option<f64>,

        /// User longitude
        #[arg(long, requires = "lat")]
        lon: Option<f64>,

        /// Search radius in kilometers
        #[arg(long)]
        radius_km: Option<f64>,
    },

    /// Embed every record and write a corpus snapshot
    Index {
        /// Records file (defaults to records.path from the configuration)
        #[arg(long)]
        records: Option<PathBuf>,

        /// Snapshot output (defaults to corpus.path from the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check service health
    Health {
        /// API endpoint to check
        #[arg(long, default_value = "http://localhost:8000")]
        endpoint: String,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: &str) -> Result<ServiceConfig> {
    if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        ServiceConfig::load(path)
    } else {
        info!("Using default configuration");
        Ok(ServiceConfig::default())
    }
}

/// Load the embedding model off the async runtime. A failure leaves semantic
/// search disabled instead of aborting startup.
async fn load_embedder(config: &ServiceConfig) -> Option<Arc<EmbeddingService>> {
    let embedding_config = config.embedding.clone();
    let loaded = tokio::task::spawn_blocking(move || EmbeddingService::new(embedding_config))
        .await
        .map_err(|e| Error::Embedding(format!("model loader panicked: {}", e)))
        .and_then(|result| result);
    match loaded {
        Ok(service) => Some(Arc::new(service)),
        Err(e) => {
            warn!("Failed to initialize embedding model: {}", e);
            warn!("Semantic search will answer 503 until the service is restarted");
            None
        }
    }
}

/// Build the search service from configuration.
async fn build_service(config: &ServiceConfig) -> Result<PostSearchService> {
    // 1. Corpus snapshot (fatal when missing or corrupt)
    let corpus = Arc::new(Corpus::load_with(
        &config.corpus.path,
        config.corpus.precision,
    )?);

    // 2. Query embedder (optional)
    let embedder = load_embedder(config).await;

    // 3. Ranker
    let search = HybridSearch::new(corpus, embedder, config.search.hybrid())?;

    // 4. Record store
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::load(&config.records.path)?);
    let corpus_size = search.corpus().len();
    let records = store.count().await?;
    if records < corpus_size {
        warn!(
            "Record store holds {} records for {} corpus vectors; unmatched ids will be skipped",
            records, corpus_size
        );
    }

    // 5. Response cache
    let cache = if config.cache.enabled {
        ResponseCache::new(Arc::new(MemoryCacheBackend::new(config.cache.max_entries)))
    } else {
        info!("Response cache disabled");
        ResponseCache::disabled()
    };

    Ok(PostSearchService::new(
        search,
        store,
        cache,
        config.cache.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { output } => {
            info!("Writing default configuration to: {}", output);
            let config = ServiceConfig::default();
            config.save(&output)?;
            info!("Configuration saved successfully");
        }

        Commands::Start { api_addr } => {
            info!("Starting delivery post search service...");

            let mut config = load_config(&cli.config)?;
            if let Some(addr) = api_addr {
                config.api.listen_address = addr;
            }

            let metrics = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Metrics exporter not installed: {}", e);
                    None
                }
            };

            let service = Arc::new(build_service(&config).await?);
            if !service.is_semantic_available() {
                warn!("Running without semantic search");
            }

            let mut state = AppState::new(service, config.search.clone());
            if let Some(handle) = metrics {
                state = state.with_metrics(handle);
            }

            info!("API address: {}", config.api.listen_address);
            info!("Press Ctrl+C to stop");
            ApiServer::new(config.api.clone(), state).run().await?;
            info!("Service stopped");
        }

        Commands::Query {
            text,
            limit,
            lat,
            lon,
            radius_km,
        } => {
            let config = load_config(&cli.config)?;
            let service = build_service(&config).await?;

            let output = match (lat, lon) {
                (Some(lat), Some(lon)) => {
                    let origin = GeoPoint::try_new(lat, lon)?;
                    let radius = radius_km.unwrap_or(config.search.default_radius_km);
                    let results = service.hybrid_search(&text, origin, radius, limit).await?;
                    serde_json::to_string_pretty(&results)?
                }
                _ => {
                    let posts = service.semantic_search(&text, limit).await?;
                    serde_json::to_string_pretty(&posts)?
                }
            };
            println!("{}", output);
        }

        Commands::Index { records, output } => {
            let config = load_config(&cli.config)?;
            let records = records.unwrap_or_else(|| config.records.path.clone());
            let output = output.unwrap_or_else(|| config.corpus.path.clone());

            let store = InMemoryRecordStore::load(&records)?;
            let embedding_config = config.embedding.clone();
            let model = tokio::task::spawn_blocking(move || FastEmbedModel::new(&embedding_config))
                .await
                .map_err(|e| Error::Embedding(format!("model loader panicked: {}", e)))??;

            info!("Embedding {} records with {}", store.len(), model.name());
            let posts = store.posts().to_vec();
            let snapshot = tokio::task::spawn_blocking(move || -> Result<CorpusSnapshot> {
                let mut ids = Vec::with_capacity(posts.len());
                let mut vectors = Vec::with_capacity(posts.len());
                for (i, post) in posts.iter().enumerate() {
                    vectors.push(model.encode(&post.corpus_text())?);
                    ids.push(post.id);
                    if (i + 1) % 1000 == 0 {
                        info!("Embedded {}/{} records", i + 1, posts.len());
                    }
                }
                Ok(CorpusSnapshot {
                    model: Some(model.name().to_string()),
                    dimension: model.dimension(),
                    ids,
                    vectors,
                })
            })
            .await
            .map_err(|e| Error::Embedding(format!("indexing task panicked: {}", e)))??;

            snapshot.write(&output)?;
            info!("Wrote {} vectors to {}", snapshot.ids.len(), output.display());
        }

        Commands::Health { endpoint } => {
            info!("Checking service health at: {}", endpoint);

            let health_url = format!("{}/health", endpoint.trim_end_matches('/'));

            match tokio::time::timeout(std::time::Duration::from_secs(5), check_health(&health_url))
                .await
            {
                Ok(Ok(response)) => {
                    info!("Service status: {}", response.status);
                    info!("Version: {}", response.version);
                    info!("Corpus size: {}", response.corpus_size);
                    info!(
                        "Semantic search: {}",
                        if response.semantic_search { "available" } else { "unavailable" }
                    );
                    info!("Uptime: {} seconds", response.uptime);
                }
                Ok(Err(e)) => {
                    error!("Health check failed: {}", e);
                    std::process::exit(1);
                }
                Err(_) => {
                    error!("Health check timed out");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Split `http://host:port/path` into the address to dial and the request path.
fn health_target(endpoint: &str) -> (&str, String) {
    let endpoint = endpoint.trim_start_matches("http://").trim_end_matches('/');
    match endpoint.split_once('/') {
        Some((addr, path)) => (addr, format!("/{}", path)),
        None => (endpoint, "/health".to_string()),
    }
}

async fn check_health(endpoint: &str) -> Result<HealthResponse> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let (addr, path) = health_target(endpoint);
    let api_err = |what: &str, e: std::io::Error| Error::Api(format!("{}: {}", what, e));

    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| api_err("Connection failed", e))?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| api_err("Write failed", e))?;
    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|e| api_err("Read failed", e))?;

    let text = String::from_utf8_lossy(&raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| Error::Api("Malformed HTTP response".to_string()))?;
    let status = head.lines().next().unwrap_or_default();
    if !status.contains(" 200 ") {
        return Err(Error::Api(format!("Unhealthy response: {}", status)));
    }
    serde_json::from_str(body).map_err(|e| Error::Api(format!("Bad health payload: {}", e)))
}
