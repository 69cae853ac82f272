//! Orchestrator process entry point: loads configuration, restores pipeline
//! state from the previous run, serves the watcher hook over HTTP, and runs
//! the periodic maintenance tick (claim sweep, idle eviction, drain
//! detection).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use enrich_orchestrator::catalog::MemoryCatalogStore;
use enrich_orchestrator::config::{CaptionProvider, Config};
use enrich_orchestrator::engine::{
    EmbeddingEngine, FaceDetectionEngine, HttpCaptionEngine, LocalCaptionEngine, TaggingEngine,
};
use enrich_orchestrator::http::create_router;
use enrich_orchestrator::model::PipelineKind;
use enrich_orchestrator::orchestrator::Orchestrator;
use enrich_orchestrator::CatalogStore;

const EXIT_CLEAN: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_FATAL_BACKEND: i32 = 2;
const EXIT_STORE_UNAVAILABLE: i32 = 3;

fn config_path_from_args() -> Option<PathBuf> {
    std::env::args().nth(1).map(PathBuf::from)
}

#[tokio::main]
async fn main() {
    let config_path = config_path_from_args();
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

    if config.devices.is_empty() {
        error!("configuration error: no devices configured");
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    let catalog: Arc<dyn CatalogStore> = Arc::new(MemoryCatalogStore::new());

    let engines = build_engines(&config);
    let orchestrator = Arc::new(Orchestrator::new(catalog, config.clone(), engines));

    // No prior run's snapshots to restore in this in-process reference
    // deployment; a persistent CatalogStore adapter would load them here.
    if let Err(e) = orchestrator.restore_on_startup(Vec::new()).await {
        error!("fatal error restoring pipeline state: {e}");
        std::process::exit(EXIT_FATAL_BACKEND);
    }

    let app = create_router(orchestrator.clone());
    let listener = match tokio::net::TcpListener::bind(&config.http_bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind watcher hook on {}: {e}", config.http_bind_addr);
            std::process::exit(EXIT_STORE_UNAVAILABLE);
        }
    };
    info!("watcher hook listening on {}", config.http_bind_addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("watcher hook server error: {e}");
        }
    });

    let maintenance_orchestrator = orchestrator.clone();
    let tick_interval = Duration::from_secs(config.claim_sweep_interval_seconds.max(1));
    let maintenance = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            maintenance_orchestrator.tick().await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping all pipelines");
        }
        _ = server => {}
        _ = maintenance => {}
    }

    if let Err(e) = orchestrator.stop_all().await {
        error!("error stopping pipelines during shutdown: {e}");
        std::process::exit(EXIT_FATAL_BACKEND);
    }

    std::process::exit(EXIT_CLEAN);
}

fn build_engines(config: &Config) -> HashMap<PipelineKind, Arc<dyn enrich_orchestrator::InferenceEngine>> {
    let mut engines: HashMap<PipelineKind, Arc<dyn enrich_orchestrator::InferenceEngine>> = HashMap::new();
    engines.insert(PipelineKind::Tagging, Arc::new(TaggingEngine::default()));
    engines.insert(PipelineKind::Embedding, Arc::new(EmbeddingEngine::default()));
    engines.insert(PipelineKind::FaceDetection, Arc::new(FaceDetectionEngine::default()));

    let captioning: Arc<dyn enrich_orchestrator::InferenceEngine> = match config.caption_provider {
        CaptionProvider::Local => Arc::new(LocalCaptionEngine),
        CaptionProvider::Http => Arc::new(HttpCaptionEngine::new(config.http_caption.clone())),
    };
    engines.insert(PipelineKind::Captioning, captioning);
    engines
}
