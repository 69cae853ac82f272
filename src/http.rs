//! C8 external interface — the watcher hook: a small axum router the file
//! watcher process calls into on scan events, plus liveness/status endpoints
//! for process supervisors and the UI.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::model::{ImageId, PipelineKind};
use crate::orchestrator::Orchestrator;

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/process_image", post(process_image))
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(orchestrator)
}

/// The watcher hook and the UI status page are expected to run same-host,
/// not cross-origin-restricted; mirrors the project's own permissive
/// internal-service CORS policy.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessImageRequest {
    pub id: Option<ImageId>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessImageResponse {
    pub image_id: ImageId,
    pub enqueued_pipelines: Vec<PipelineKind>,
}

/// Idempotently enqueues `id` on every pipeline flagged `auto_on_scan` in the
/// current config. `path`-only requests are rejected: registering a new image
/// from a bare path is the watcher/scanner's job, not this adapter's.
async fn process_image(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ProcessImageRequest>,
) -> Result<(StatusCode, Json<ProcessImageResponse>), StatusCode> {
    // Path-only registration would require minting a new catalog row, which
    // is the watcher/scanner's responsibility, not this adapter's.
    let image_id = request.id.ok_or(StatusCode::BAD_REQUEST)?;

    orchestrator
        .catalog_has_image(image_id)
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let mut enqueued = Vec::new();
    for pipeline in PipelineKind::ALL {
        if !orchestrator.auto_on_scan(pipeline) {
            continue;
        }
        let inserted = orchestrator
            .enqueue_images(pipeline, &[image_id], 0)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        if inserted > 0 {
            enqueued.push(pipeline);
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessImageResponse {
            image_id,
            enqueued_pipelines: enqueued,
        }),
    ))
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pipeline: PipelineKind,
    pub state: crate::model::WorkerState,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub pipelines: Vec<PipelineStatus>,
}

async fn get_status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<StatusResponse> {
    let pipelines = PipelineKind::ALL
        .iter()
        .map(|&pipeline| {
            let snapshot = orchestrator.snapshot(pipeline);
            PipelineStatus {
                pipeline,
                state: orchestrator.pipeline_state(pipeline),
                processed: snapshot.processed,
                failed: snapshot.failed,
                skipped: snapshot.skipped,
                queue_depth: orchestrator.queue_depth(pipeline).unwrap_or(0),
            }
        })
        .collect();
    Json(StatusResponse { pipelines })
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

async fn get_health(State(_orchestrator): State<Arc<Orchestrator>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

async fn get_metrics(State(orchestrator): State<Arc<Orchestrator>>) -> String {
    metrics::refresh_from(&orchestrator);
    metrics::render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalogStore;
    use crate::config::Config;
    use crate::engine::{EmbeddingEngine, FaceDetectionEngine, LocalCaptionEngine, TaggingEngine};
    use crate::model::Image;
    use std::collections::HashMap;

    fn test_orchestrator() -> (Arc<Orchestrator>, ImageId) {
        let store = Arc::new(MemoryCatalogStore::new());
        let image_id = store.register_image(Image {
            id: 0,
            path: "/tmp/a.png".into(),
            file_size: 10,
            fingerprint: None,
            needs_tagging: Some(true),
            needs_captioning: None,
            needs_embedding: None,
            needs_face_detection: None,
        });
        let mut engines: HashMap<PipelineKind, Arc<dyn crate::engine::InferenceEngine>> = HashMap::new();
        engines.insert(PipelineKind::Tagging, Arc::new(TaggingEngine::default()));
        engines.insert(PipelineKind::Embedding, Arc::new(EmbeddingEngine::default()));
        engines.insert(PipelineKind::FaceDetection, Arc::new(FaceDetectionEngine::default()));
        engines.insert(PipelineKind::Captioning, Arc::new(LocalCaptionEngine));
        let mut config = Config::default();
        config.devices = vec![0];
        config.vram_capacity_gb.insert(0, 24.0);
        (Arc::new(Orchestrator::new(store, config, engines)), image_id)
    }

    #[tokio::test]
    async fn process_image_without_id_or_path_is_bad_request() {
        let (orchestrator, _) = test_orchestrator();
        let result = process_image(
            State(orchestrator),
            Json(ProcessImageRequest { id: None, path: None }),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_image_with_unknown_id_is_not_found() {
        let (orchestrator, image_id) = test_orchestrator();
        let result = process_image(
            State(orchestrator),
            Json(ProcessImageRequest { id: Some(image_id + 999), path: None }),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn process_image_with_known_id_enqueues_auto_on_scan_pipelines() {
        let (orchestrator, image_id) = test_orchestrator();
        let (status, Json(body)) = process_image(
            State(orchestrator),
            Json(ProcessImageRequest { id: Some(image_id), path: None }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.enqueued_pipelines.contains(&PipelineKind::Tagging));
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (orchestrator, _) = test_orchestrator();
        let Json(body) = get_health(State(orchestrator)).await;
        assert_eq!(body.status, "healthy");
    }
}
