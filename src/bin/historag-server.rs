//! historag HTTP server binary

use historag::config::EngineConfig;
use historag::crawler::HttpRetriever;
use historag::generation::HttpCompletionClient;
use historag::profile::ProfileStore;
use historag::runtime::{Collaborators, Pipeline};
use historag::search::{CandidateSearch, Corpus, CorpusSearch, HttpSemanticSearch};
use historag::server::{run_server, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    // First positional argument, else HISTORAG_CONFIG, else built-in defaults
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HISTORAG_CONFIG").ok())
        .map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;
    info!("historag {} starting", env!("CARGO_PKG_VERSION"));

    let corpus = Arc::new(Corpus::load(Path::new(&config.services.corpus_path))?);
    let index = Arc::new(corpus.build_index()?);
    let profiles = ProfileStore::open(&config.services.profile_dir)?;

    let search: Arc<dyn CandidateSearch> = match config.services.semantic_url {
        Some(ref url) => {
            info!("Semantic service: {}", url);
            Arc::new(HttpSemanticSearch::new(url.clone(), corpus.clone()))
        }
        None => {
            info!("No semantic service configured; /ask falls back to corpus BM25");
            Arc::new(CorpusSearch::new(corpus.clone(), index.clone()))
        }
    };

    let pipeline = Pipeline::start(
        &config,
        index,
        profiles.clone(),
        Collaborators {
            retriever: Box::new(HttpRetriever::new(config.services.scraper_url.clone())),
            completion: Box::new(HttpCompletionClient::new(
                config.services.completion_url.clone(),
                &config.generation,
            )),
        },
    );

    let state = AppState {
        post: pipeline.post.clone(),
        search,
        profiles,
        confidence: pipeline.confidence.clone(),
        confidence_threshold: config.confidence_threshold,
        answer_timeout: config.answer_timeout(),
        search_k: config.top_n,
    };

    run_server(state, config.services.port).await?;
    pipeline.shutdown().await;

    Ok(())
}
