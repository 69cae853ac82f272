//! End-to-end scenarios over the in-memory catalog and simulated engines,
//! covering the orchestrator's seed behaviors: single-pipeline processing,
//! priority jumps, pause/stop VRAM semantics, dedup replay, crash recovery,
//! and dynamic VRAM reallocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use enrich_orchestrator::catalog::{CatalogStore, MemoryCatalogStore};
use enrich_orchestrator::config::Config;
use enrich_orchestrator::engine::{EmbeddingEngine, FaceDetectionEngine, LocalCaptionEngine, TaggingEngine};
use enrich_orchestrator::model::{FingerprintInputs, Image, PipelineKind, WorkerState};
use enrich_orchestrator::orchestrator::Orchestrator;
use enrich_orchestrator::InferenceEngine;

fn write_temp_image(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.devices = vec![0];
    config.vram_capacity_gb.insert(0, 24.0);
    config.claim_ttl_seconds = 2;
    config.claim_sweep_interval_seconds = 1;
    config.drain_grace_seconds = 1;
    config
}

fn all_engines() -> HashMap<PipelineKind, Arc<dyn InferenceEngine>> {
    let mut engines: HashMap<PipelineKind, Arc<dyn InferenceEngine>> = HashMap::new();
    engines.insert(PipelineKind::Tagging, Arc::new(TaggingEngine::default()));
    engines.insert(PipelineKind::Embedding, Arc::new(EmbeddingEngine::default()));
    engines.insert(PipelineKind::FaceDetection, Arc::new(FaceDetectionEngine::default()));
    engines.insert(PipelineKind::Captioning, Arc::new(LocalCaptionEngine));
    engines
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_image_tagging_completes_and_releases_vram_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_image(&dir, "i1.png", b"fake-png-bytes-1");

    let store = Arc::new(MemoryCatalogStore::new());
    let id = store.register_image(Image {
        id: 0,
        path,
        file_size: 16,
        fingerprint: None,
        needs_tagging: Some(true),
        needs_captioning: None,
        needs_embedding: None,
        needs_face_detection: None,
    });
    store.enqueue(PipelineKind::Tagging, &[id], 0).unwrap();

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), base_config(), all_engines()));
    orchestrator.start(PipelineKind::Tagging).await.unwrap();

    wait_until(
        || store.get_image(id).unwrap().needs_tagging == Some(false),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(store.queue_depth(PipelineKind::Tagging).unwrap(), 0);

    orchestrator.pause(PipelineKind::Tagging).await.unwrap();
    let paused_usage = orchestrator.vram_used_gb(0);
    assert!(paused_usage > 0.0);

    orchestrator.stop(PipelineKind::Tagging).await.unwrap();
    assert_eq!(orchestrator.vram_used_gb(0), 0.0);
}

#[tokio::test]
async fn priority_jump_is_processed_ahead_of_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalogStore::new());

    let mut low_priority_ids = Vec::new();
    for i in 0..20 {
        let path = write_temp_image(&dir, &format!("low-{i}.png"), format!("low-{i}").as_bytes());
        let id = store.register_image(Image {
            id: 0,
            path,
            file_size: 16,
            fingerprint: None,
            needs_tagging: Some(true),
            needs_captioning: None,
            needs_embedding: None,
            needs_face_detection: None,
        });
        low_priority_ids.push(id);
    }
    store.enqueue(PipelineKind::Tagging, &low_priority_ids, 0).unwrap();

    let urgent_path = write_temp_image(&dir, "urgent.png", b"urgent-bytes");
    let urgent_id = store.register_image(Image {
        id: 0,
        path: urgent_path,
        file_size: 16,
        fingerprint: None,
        needs_tagging: Some(true),
        needs_captioning: None,
        needs_embedding: None,
        needs_face_detection: None,
    });

    let mut config = base_config();
    config.batch_size.insert(PipelineKind::Tagging.into(), 1);
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), config, all_engines()));

    orchestrator
        .enqueue_images(PipelineKind::Tagging, &[urgent_id], enrich_orchestrator::queue::PRIORITY_NOW)
        .unwrap();
    orchestrator.start(PipelineKind::Tagging).await.unwrap();

    wait_until(
        || store.get_image(urgent_id).unwrap().needs_tagging == Some(false),
        Duration::from_secs(3),
    )
    .await;

    let remaining_low_priority = low_priority_ids
        .iter()
        .filter(|&&id| store.get_image(id).unwrap().needs_tagging == Some(true))
        .count();
    assert!(remaining_low_priority >= low_priority_ids.len() - 2);

    orchestrator.stop(PipelineKind::Tagging).await.unwrap();
}

#[tokio::test]
async fn pause_keeps_captioning_hot_stop_releases_it() {
    let store = Arc::new(MemoryCatalogStore::new());
    let mut config = base_config();
    config
        .solo_allocation
        .insert(PipelineKind::Captioning.into(), enrich_orchestrator::config::AllocationVector(vec![1]));
    let orchestrator = Arc::new(Orchestrator::new(store, config, all_engines()));

    orchestrator.start(PipelineKind::Captioning).await.unwrap();
    let loaded_usage = orchestrator.vram_used_gb(0);
    assert!(loaded_usage > 0.0);

    orchestrator.pause(PipelineKind::Captioning).await.unwrap();
    assert_eq!(orchestrator.pipeline_state(PipelineKind::Captioning), WorkerState::Paused);
    assert_eq!(orchestrator.vram_used_gb(0), loaded_usage);

    orchestrator.stop(PipelineKind::Captioning).await.unwrap();
    assert_eq!(orchestrator.vram_used_gb(0), 0.0);
}

#[tokio::test]
async fn dedup_replay_runs_inference_once_and_reassigns_on_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalogStore::new());

    let fp = FingerprintInputs {
        prompt: Some("a cat on a roof".into()),
        seed: Some(42),
        ..Default::default()
    };
    let fingerprint = enrich_orchestrator::model::ContentFingerprint::compute(&fp).unwrap();

    let i3_path = write_temp_image(&dir, "i3.png", b"small");
    let i4_path = write_temp_image(&dir, "i4.png", b"the-largest-file-here");
    let i5_path = write_temp_image(&dir, "i5.png", b"tiny");

    let i3 = store.register_image(Image {
        id: 0,
        path: i3_path,
        file_size: std::fs::metadata(dir.path().join("i3.png")).unwrap().len(),
        fingerprint: Some(fingerprint),
        needs_tagging: None,
        needs_captioning: None,
        needs_embedding: Some(true),
        needs_face_detection: None,
    });
    let i4 = store.register_image(Image {
        id: 0,
        path: i4_path,
        file_size: std::fs::metadata(dir.path().join("i4.png")).unwrap().len(),
        fingerprint: Some(fingerprint),
        needs_tagging: None,
        needs_captioning: None,
        needs_embedding: Some(true),
        needs_face_detection: None,
    });
    let i5 = store.register_image(Image {
        id: 0,
        path: i5_path,
        file_size: std::fs::metadata(dir.path().join("i5.png")).unwrap().len(),
        fingerprint: Some(fingerprint),
        needs_tagging: None,
        needs_captioning: None,
        needs_embedding: Some(true),
        needs_face_detection: None,
    });

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), base_config(), all_engines()));
    orchestrator
        .enqueue_images(PipelineKind::Embedding, &[i3, i4, i5], 0)
        .unwrap();

    // Only the representative (i4, the largest file) should ever be queued.
    assert_eq!(store.queue_depth(PipelineKind::Embedding).unwrap(), 1);

    orchestrator.start(PipelineKind::Embedding).await.unwrap();
    wait_until(
        || store.get_image(i4).unwrap().needs_embedding == Some(false),
        Duration::from_secs(5),
    )
    .await;
    orchestrator.stop(PipelineKind::Embedding).await.unwrap();

    let group = store.get_group(fingerprint).unwrap().unwrap();
    assert_eq!(group.embedding_source_id, Some(i4));
    assert_eq!(store.get_image(i3).unwrap().needs_embedding, Some(false));
    assert_eq!(store.get_image(i5).unwrap().needs_embedding, Some(false));

    // i4's file disappears; the group reassigns its representative.
    let new_representative = enrich_orchestrator::dedup::DeduplicationEngine::new(store.clone())
        .reassign_representative(fingerprint, i4)
        .unwrap();
    assert!(new_representative.is_some());
    let group_after = store.get_group(fingerprint).unwrap().unwrap();
    assert_ne!(group_after.representative_image_id, i4);
    assert_eq!(
        store.get_image(group_after.representative_image_id).unwrap().needs_embedding,
        Some(true)
    );
}

#[tokio::test]
async fn crash_recovery_releases_expired_claims_without_duplication() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalogStore::new());

    let mut ids = Vec::new();
    for i in 0..5 {
        let path = write_temp_image(&dir, &format!("img-{i}.png"), format!("bytes-{i}").as_bytes());
        let id = store.register_image(Image {
            id: 0,
            path,
            file_size: 8,
            fingerprint: None,
            needs_tagging: Some(true),
            needs_captioning: None,
            needs_embedding: None,
            needs_face_detection: None,
        });
        ids.push(id);
    }
    store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();

    let claimed = store
        .claim_batch(PipelineKind::Tagging, "worker-that-died", 5, chrono::Duration::milliseconds(1))
        .unwrap();
    assert_eq!(claimed.len(), 5);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let released = store.release_expired_claims(PipelineKind::Tagging).unwrap();
    assert_eq!(released, 5);

    let reclaimed = store
        .claim_batch(PipelineKind::Tagging, "worker-that-lived", 10, chrono::Duration::seconds(60))
        .unwrap();
    assert_eq!(reclaimed.len(), 5);
    let reclaimed_ids: std::collections::HashSet<_> = reclaimed.iter().map(|e| e.image_id).collect();
    assert_eq!(reclaimed_ids, ids.into_iter().collect());
}

#[tokio::test]
async fn dynamic_reallocation_grows_captioning_when_tagging_drains() {
    let store = Arc::new(MemoryCatalogStore::new());
    let mut config = base_config();
    let one = enrich_orchestrator::config::AllocationVector(vec![1]);
    let two = enrich_orchestrator::config::AllocationVector(vec![2]);
    config.concurrent_allocation.insert(PipelineKind::Tagging.into(), one.clone());
    config.concurrent_allocation.insert(PipelineKind::Captioning.into(), one);
    config.solo_allocation.insert(PipelineKind::Tagging.into(), two.clone());
    config.solo_allocation.insert(PipelineKind::Captioning.into(), two);

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), config, all_engines()));
    orchestrator.start(PipelineKind::Tagging).await.unwrap();
    orchestrator.start(PipelineKind::Captioning).await.unwrap();

    let plan_before = orchestrator.placement_plan();
    assert_eq!(plan_before.total_for_pipeline(PipelineKind::Captioning), 1);

    // Tagging's queue is already empty; drive enough ticks to cross the
    // drain-grace threshold and trigger reallocation.
    for _ in 0..3 {
        orchestrator.tick().await;
    }

    wait_until(
        || orchestrator.placement_plan().total_for_pipeline(PipelineKind::Captioning) == 2,
        Duration::from_secs(3),
    )
    .await;

    orchestrator.stop_all().await.unwrap();
}
