//! A4 — Prometheus metrics: queue depth, processed/failed counters, VRAM
//! utilization, and worker pool occupancy, registered once at process start.

use once_cell::sync::Lazy;
use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};

use crate::model::PipelineKind;
use crate::orchestrator::Orchestrator;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("enrich_queue_depth", "Pending + claimed entries per pipeline"),
        &["pipeline"],
    )
    .expect("metric construction");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

// Mirror `WorkerSnapshot.processed`/`.failed`, which are already
// cumulative-per-pipeline; refreshed as gauges on every scrape rather than
// incremented at each call site, so no instrumentation is threaded through
// the worker loop itself.
pub static PROCESSED_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("enrich_processed_total", "Entries successfully processed per pipeline"),
        &["pipeline"],
    )
    .expect("metric construction");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

pub static FAILED_TOTAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("enrich_failed_total", "Entries moved to Failed per pipeline"),
        &["pipeline"],
    )
    .expect("metric construction");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

pub static VRAM_USED_GB: Lazy<GaugeVec> = Lazy::new(|| {
    let gauge = GaugeVec::new(
        Opts::new("enrich_vram_used_gb", "VRAM attributed to loaded instances per device"),
        &["device"],
    )
    .expect("metric construction");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

pub static WORKER_POOL_OCCUPANCY: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("enrich_worker_pool_occupancy", "Loaded instances currently in use per pipeline"),
        &["pipeline"],
    )
    .expect("metric construction");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

/// Pulls every gauge's current value from live orchestrator state. Called
/// on each `/metrics` scrape rather than threading `.set()`/`.inc()` calls
/// through the worker loop and VRAM planner.
pub fn refresh_from(orchestrator: &Orchestrator) {
    for pipeline in PipelineKind::ALL {
        let label = pipeline.as_str();
        let snapshot = orchestrator.snapshot(pipeline);
        QUEUE_DEPTH
            .with_label_values(&[label])
            .set(orchestrator.queue_depth(pipeline).unwrap_or(0) as i64);
        PROCESSED_TOTAL.with_label_values(&[label]).set(snapshot.processed as i64);
        FAILED_TOTAL.with_label_values(&[label]).set(snapshot.failed as i64);
        WORKER_POOL_OCCUPANCY
            .with_label_values(&[label])
            .set(orchestrator.worker_pool_occupancy(pipeline) as i64);
    }
    for device in orchestrator.devices() {
        VRAM_USED_GB
            .with_label_values(&[&device.to_string()])
            .set(orchestrator.vram_used_gb(device));
    }
}

/// Renders the registry in Prometheus text exposition format, for the
/// watcher hook's metrics endpoint.
pub fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).expect("metrics encode");
    String::from_utf8(buffer).expect("metrics are valid utf8")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::catalog::MemoryCatalogStore;
    use crate::config::Config;
    use crate::engine::{EmbeddingEngine, FaceDetectionEngine, LocalCaptionEngine, TaggingEngine};
    use crate::engine::InferenceEngine;

    #[test]
    fn queue_depth_gauge_records_per_pipeline_values() {
        QUEUE_DEPTH.with_label_values(&["tagging"]).set(5);
        let rendered = render();
        assert!(rendered.contains("enrich_queue_depth"));
    }

    #[test]
    fn refresh_from_pulls_queue_depth_and_vram_from_orchestrator() {
        let store = Arc::new(MemoryCatalogStore::new());
        let mut config = Config::default();
        config.devices = vec![0];
        config.vram_capacity_gb.insert(0, 24.0);

        let mut engines: HashMap<PipelineKind, Arc<dyn InferenceEngine>> = HashMap::new();
        engines.insert(PipelineKind::Tagging, Arc::new(TaggingEngine::default()));
        engines.insert(PipelineKind::Embedding, Arc::new(EmbeddingEngine::default()));
        engines.insert(PipelineKind::FaceDetection, Arc::new(FaceDetectionEngine::default()));
        engines.insert(PipelineKind::Captioning, Arc::new(LocalCaptionEngine));

        let orchestrator = Orchestrator::new(store, config, engines);
        refresh_from(&orchestrator);

        let rendered = render();
        assert!(rendered.contains("enrich_vram_used_gb"));
        assert!(rendered.contains("enrich_worker_pool_occupancy"));
    }
}
