//! C8 — Orchestrator: per-pipeline lifecycle state machine coordinating the
//! VRAM Planner, Model Pool, Worker Pool, and Queue Manager, and the single
//! source of truth for `WorkerSnapshot` journaling and progress events.

mod state;

pub use state::{transition, TransitionError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::dedup::{DeduplicationEngine, EnqueueDecision};
use crate::engine::InferenceEngine;
use crate::error::OrchestratorError;
use crate::model::{DesiredState, PipelineKind, ProgressEvent, WorkerSnapshot, WorkerState};
use crate::pool::ModelPool;
use crate::queue::QueueManager;
use crate::vram::VramPlanner;
use crate::workers::{default_config_for, worker_counts_from_plan, Gate, WorkerFleet, WorkerHost, WorkerPoolConfig};

struct PipelineRuntime {
    snapshot: RwLock<WorkerSnapshot>,
    gate: Gate,
    fleet: RwLock<Option<WorkerFleet>>,
    quiet_ticks: AtomicU32,
}

impl PipelineRuntime {
    fn new(pipeline: PipelineKind) -> Self {
        Self {
            snapshot: RwLock::new(WorkerSnapshot::new(pipeline)),
            gate: Gate::new_open(),
            fleet: RwLock::new(None),
            quiet_ticks: AtomicU32::new(0),
        }
    }

    fn state(&self) -> WorkerState {
        match self.snapshot.read().desired_state {
            DesiredState::Running if self.fleet.read().is_some() => WorkerState::Running,
            DesiredState::Running => WorkerState::Starting,
            DesiredState::Paused => WorkerState::Paused,
            DesiredState::Stopped => WorkerState::Stopped,
        }
    }
}

/// Coordinates C3 (VRAM Planner), C4 (Model Pool), C5 (Worker Pool), C6
/// (Queue Manager), and C7 (Deduplication Engine) behind the lifecycle API
/// the control surface (CLI/HTTP) calls into.
pub struct Orchestrator {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<QueueManager>,
    dedup: Arc<DeduplicationEngine>,
    planner: Arc<VramPlanner>,
    model_pool: Arc<ModelPool>,
    runtimes: HashMap<PipelineKind, Arc<PipelineRuntime>>,
    config: RwLock<Config>,
    events: broadcast::Sender<ProgressEvent>,
    worker_config: HashMap<PipelineKind, Arc<WorkerPoolConfig>>,
    drain_grace_ticks: u32,
}

struct Host {
    catalog: Arc<dyn CatalogStore>,
    runtimes: HashMap<PipelineKind, Arc<PipelineRuntime>>,
    orchestrator: std::sync::Weak<Orchestrator>,
}

#[async_trait]
impl WorkerHost for Host {
    fn gate(&self, pipeline: PipelineKind) -> Gate {
        self.runtimes.get(&pipeline).expect("runtime registered").gate.clone()
    }

    async fn load_image_bytes(&self, image_id: crate::model::ImageId) -> std::io::Result<Vec<u8>> {
        let path = self
            .catalog
            .get_image(image_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?
            .path;
        tokio::task::spawn_blocking(move || std::fs::read(path))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
    }

    fn on_fatal(&self, pipeline: PipelineKind, reason: String) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            tokio::spawn(async move {
                orchestrator.on_fatal(pipeline, reason).await;
            });
        }
    }
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        config: Config,
        engines: HashMap<PipelineKind, Arc<dyn InferenceEngine>>,
    ) -> Self {
        let model_cost_bytes = engines
            .iter()
            .map(|(&p, e)| (p, e.estimate_vram_bytes(*config.devices.first().unwrap_or(&0))))
            .collect();
        let planner = Arc::new(VramPlanner::new(&config, model_cost_bytes));
        let model_pool = Arc::new(ModelPool::new());
        for (&pipeline, engine) in &engines {
            let ttl = if pipeline == PipelineKind::Captioning {
                config.captioning_model_ttl_minutes
            } else {
                -1
            };
            model_pool.register_engine(pipeline, engine.clone(), ttl);
        }

        let queue = Arc::new(QueueManager::new(catalog.clone(), &config));
        let dedup = Arc::new(DeduplicationEngine::new(catalog.clone()));
        let runtimes = PipelineKind::ALL
            .iter()
            .map(|&p| (p, Arc::new(PipelineRuntime::new(p))))
            .collect();
        let worker_config = PipelineKind::ALL
            .iter()
            .map(|&p| {
                (
                    p,
                    Arc::new(default_config_for(
                        config.batch_size_for(p),
                        config.claim_ttl_seconds,
                        config.max_attempts,
                    )),
                )
            })
            .collect();
        let (events, _rx) = broadcast::channel(256);
        let drain_grace_ticks = (config.drain_grace_seconds.max(1)) as u32;

        Self {
            catalog,
            queue,
            dedup,
            planner,
            model_pool,
            runtimes,
            config: RwLock::new(config),
            events,
            worker_config,
            drain_grace_ticks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn runtime(&self, pipeline: PipelineKind) -> Arc<PipelineRuntime> {
        self.runtimes.get(&pipeline).expect("all pipelines registered").clone()
    }

    fn host(self: &Arc<Self>) -> Arc<Host> {
        Arc::new(Host {
            catalog: self.catalog.clone(),
            runtimes: self.runtimes.clone(),
            orchestrator: Arc::downgrade(self),
        })
    }

    async fn on_fatal(self: &Arc<Self>, pipeline: PipelineKind, reason: String) {
        error!("{pipeline}: fatal error ({reason}), stopping pipeline");
        let runtime = self.runtime(pipeline);
        runtime.snapshot.write().last_error_kind = Some("fatal".to_string());
        if let Err(e) = self.stop(pipeline).await {
            warn!("{pipeline}: stop after fatal error failed: {e}");
        }
    }

    /// `Stopped -> Starting -> Running`. No-op if already running/starting.
    pub async fn start(self: &Arc<Self>, pipeline: PipelineKind) -> Result<(), OrchestratorError> {
        let runtime = self.runtime(pipeline);
        if matches!(runtime.state(), WorkerState::Running | WorkerState::Starting) {
            return Ok(());
        }

        transition(runtime.state(), WorkerState::Starting)
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        {
            let mut snapshot = runtime.snapshot.write();
            snapshot.desired_state = DesiredState::Running;
            snapshot.last_changed_at = chrono::Utc::now();
        }

        for (candidate, counts) in self.planner.shrink_for_admission(pipeline) {
            self.model_pool.apply_plan(candidate, &self.planner.current_plan())?;
            info!("{candidate}: shrunk to admit {pipeline} (now {counts:?})");
        }

        let plan_counts = self.planner.plan_for_start(pipeline)?;
        self.planner.commit_start(pipeline, plan_counts.clone());
        self.model_pool.apply_plan(pipeline, &self.planner.current_plan())?;

        runtime.gate.open();
        let worker_count = worker_counts_from_plan(&plan_counts);
        let host = self.host();
        let fleet = WorkerFleet::spawn(
            pipeline,
            worker_count,
            self.catalog.clone(),
            self.model_pool.clone(),
            host,
            self.worker_config.get(&pipeline).expect("worker config registered").clone(),
        );
        *runtime.fleet.write() = Some(fleet);

        info!("{pipeline}: started with {worker_count} workers, plan {plan_counts:?}");
        self.emit_progress(pipeline);
        Ok(())
    }

    /// `Running -> Pausing -> Paused`: closes the gate, keeps instances hot.
    pub async fn pause(self: &Arc<Self>, pipeline: PipelineKind) -> Result<(), OrchestratorError> {
        let runtime = self.runtime(pipeline);
        if runtime.state() == WorkerState::Paused {
            return Ok(());
        }
        runtime.gate.close();
        runtime.snapshot.write().desired_state = DesiredState::Paused;
        info!("{pipeline}: paused (VRAM retained)");
        self.emit_progress(pipeline);
        Ok(())
    }

    /// `Paused -> Running` directly (no `Starting` step): reopens the gate
    /// and reuses the still-loaded fleet. If the pipeline was restored from
    /// disk `Paused` (no fleet ever loaded this process), falls back to a
    /// cold `start` instead.
    pub async fn resume(self: &Arc<Self>, pipeline: PipelineKind) -> Result<(), OrchestratorError> {
        let runtime = self.runtime(pipeline);
        if runtime.state() != WorkerState::Paused {
            return self.start(pipeline).await;
        }

        if runtime.fleet.read().is_none() {
            runtime.snapshot.write().desired_state = DesiredState::Stopped;
            return self.start(pipeline).await;
        }

        transition(runtime.state(), WorkerState::Running)
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        runtime.gate.open();
        runtime.snapshot.write().desired_state = DesiredState::Running;
        info!("{pipeline}: resumed (VRAM and fleet reused)");
        self.emit_progress(pipeline);
        Ok(())
    }

    /// `Running|Paused -> Stopping -> Stopped`: closes the gate, drains
    /// workers, unloads every instance for this pipeline.
    pub async fn stop(self: &Arc<Self>, pipeline: PipelineKind) -> Result<(), OrchestratorError> {
        let runtime = self.runtime(pipeline);
        if runtime.state() == WorkerState::Stopped {
            return Ok(());
        }
        runtime.gate.close();
        runtime.snapshot.write().desired_state = DesiredState::Stopped;

        let fleet = runtime.fleet.write().take();
        if let Some(fleet) = fleet {
            fleet.shutdown().await;
        }

        self.planner.commit_stop(pipeline);
        self.model_pool.apply_plan(pipeline, &self.planner.current_plan())?;
        info!("{pipeline}: stopped, VRAM released");
        self.emit_progress(pipeline);
        Ok(())
    }

    pub async fn clear(&self, pipeline: PipelineKind) -> Result<usize, OrchestratorError> {
        Ok(self.catalog.clear(pipeline)?)
    }

    pub async fn clear_all(&self) -> Result<usize, OrchestratorError> {
        Ok(self.catalog.clear_all()?)
    }

    pub async fn start_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        for pipeline in PipelineKind::ALL {
            self.start(pipeline).await?;
        }
        Ok(())
    }

    pub async fn pause_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        for pipeline in PipelineKind::ALL {
            self.pause(pipeline).await?;
        }
        Ok(())
    }

    pub async fn stop_all(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        for pipeline in PipelineKind::ALL {
            self.stop(pipeline).await?;
        }
        Ok(())
    }

    /// Enqueues `image_ids` for `pipeline`; for Embedding, routes each image
    /// through the Deduplication Engine first so only group representatives
    /// ever reach the queue.
    pub fn enqueue_images(
        &self,
        pipeline: PipelineKind,
        image_ids: &[crate::model::ImageId],
        priority: i64,
    ) -> Result<usize, OrchestratorError> {
        if pipeline != PipelineKind::Embedding {
            return Ok(self.queue.enqueue_images(pipeline, image_ids, priority)?);
        }

        let mut inserted = 0;
        for &id in image_ids {
            match self.dedup.resolve_enqueue(id)? {
                EnqueueDecision::EnqueueDirectly => {
                    inserted += self.queue.enqueue_images(pipeline, &[id], priority)?;
                }
                EnqueueDecision::EnqueueRepresentative { image_id: representative, superseded } => {
                    inserted += self.queue.enqueue_images(pipeline, &[representative], priority)?;
                    if let Some(stale) = superseded {
                        if stale != representative {
                            self.catalog.cancel_pending(pipeline, &[stale])?;
                        }
                    }
                }
                EnqueueDecision::Skipped => {}
            }
        }
        Ok(inserted)
    }

    pub fn enqueue_folder(
        &self,
        pipeline: PipelineKind,
        folder_id: &str,
        recursive: bool,
        priority: i64,
    ) -> Result<usize, OrchestratorError> {
        Ok(self.queue.enqueue_folder(pipeline, folder_id, recursive, priority)?)
    }

    /// "Embed now" / "Caption now": enqueues at elevated priority and starts
    /// the pipeline if it was Stopped or Paused.
    pub async fn process_now(
        self: &Arc<Self>,
        pipeline: PipelineKind,
        image_ids: &[crate::model::ImageId],
    ) -> Result<usize, OrchestratorError> {
        let inserted = self.enqueue_images(pipeline, image_ids, crate::queue::PRIORITY_NOW)?;
        match self.runtime(pipeline).state() {
            WorkerState::Stopped => self.start(pipeline).await?,
            WorkerState::Paused => self.resume(pipeline).await?,
            _ => {}
        }
        Ok(inserted)
    }

    pub fn list_failed(&self, pipeline: PipelineKind) -> Result<Vec<crate::model::FailedEntry>, OrchestratorError> {
        Ok(self.catalog.list_failed(pipeline)?)
    }

    pub fn requeue_failed(
        &self,
        pipeline: PipelineKind,
        image_ids: &[crate::model::ImageId],
    ) -> Result<usize, OrchestratorError> {
        Ok(self.catalog.requeue_failed(pipeline, image_ids)?)
    }

    /// Restores lifecycle state from persisted [`WorkerSnapshot`]s: pipelines
    /// whose `desired_state` was `Running` reload models, `Paused` pipelines
    /// stay unloaded until resumed.
    pub async fn restore_on_startup(self: &Arc<Self>, snapshots: Vec<WorkerSnapshot>) -> Result<(), OrchestratorError> {
        for snapshot in snapshots {
            let runtime = self.runtime(snapshot.pipeline);
            *runtime.snapshot.write() = snapshot.clone();
            match snapshot.desired_state {
                DesiredState::Running => {
                    runtime.snapshot.write().desired_state = DesiredState::Stopped;
                    self.start(snapshot.pipeline).await?;
                }
                DesiredState::Paused => {
                    runtime.gate.close();
                }
                DesiredState::Stopped => {}
            }
        }
        Ok(())
    }

    pub fn snapshot(&self, pipeline: PipelineKind) -> WorkerSnapshot {
        self.runtime(pipeline).snapshot.read().clone()
    }

    pub fn all_snapshots(&self) -> Vec<WorkerSnapshot> {
        PipelineKind::ALL.iter().map(|&p| self.snapshot(p)).collect()
    }

    pub fn pipeline_state(&self, pipeline: PipelineKind) -> WorkerState {
        self.runtime(pipeline).state()
    }

    pub fn vram_used_gb(&self, device: usize) -> f64 {
        self.planner.used_gb(device)
    }

    pub fn worker_pool_occupancy(&self, pipeline: PipelineKind) -> usize {
        self.model_pool.occupancy(pipeline)
    }

    pub fn devices(&self) -> Vec<usize> {
        self.config.read().devices.clone()
    }

    pub fn placement_plan(&self) -> crate::vram::PlacementPlan {
        self.planner.current_plan()
    }

    pub fn queue_depth(&self, pipeline: PipelineKind) -> Result<u64, OrchestratorError> {
        Ok(self.catalog.queue_depth(pipeline)?)
    }

    pub fn auto_on_scan(&self, pipeline: PipelineKind) -> bool {
        self.config.read().auto_on_scan_for(pipeline)
    }

    /// Confirms `image_id` is registered in the catalog, for the watcher
    /// hook's `POST /process_image`.
    pub fn catalog_has_image(&self, image_id: crate::model::ImageId) -> Result<(), OrchestratorError> {
        self.catalog.get_image(image_id)?;
        Ok(())
    }

    fn emit_progress(&self, pipeline: PipelineKind) {
        let runtime = self.runtime(pipeline);
        let snapshot = runtime.snapshot.read().clone();
        let queue_depth = self.catalog.queue_depth(pipeline).unwrap_or(0);
        let vram_used_gb = self
            .config
            .read()
            .devices
            .iter()
            .map(|&d| self.planner.used_gb(d))
            .sum();
        let event = ProgressEvent {
            pipeline,
            state: runtime.state(),
            queue_depth,
            processed_total: snapshot.processed,
            failed_total: snapshot.failed,
            throughput_per_minute: 0.0,
            eta_seconds: None,
            vram_used_gb,
        };
        let _ = self.events.send(event);
    }

    /// Periodic tick invoked by `main`'s maintenance loop: sweeps expired
    /// claims, evicts idle captioning instances, and evaluates drain
    /// detection for every running pipeline.
    pub async fn tick(self: &Arc<Self>) {
        if let Err(e) = self.queue.sweep_expired_claims() {
            warn!("claim sweep failed: {e}");
        }
        self.model_pool.sweep_idle();

        for pipeline in PipelineKind::ALL {
            let runtime = self.runtime(pipeline);
            if runtime.state() != WorkerState::Running {
                runtime.quiet_ticks.store(0, Ordering::SeqCst);
                continue;
            }
            let depth = self.catalog.queue_depth(pipeline).unwrap_or(u64::MAX);
            let has_claims = self.catalog.has_active_claims(pipeline).unwrap_or(true);
            let fallback_empty = self
                .catalog
                .list_images_needing(pipeline, 1)
                .map(|v| v.is_empty())
                .unwrap_or(false);

            if depth == 0 && !has_claims && fallback_empty {
                let ticks = runtime.quiet_ticks.fetch_add(1, Ordering::SeqCst) + 1;
                if ticks == self.drain_grace_ticks {
                    info!("{pipeline}: drained, triggering VRAM reallocation");
                    let deltas = self.planner.on_drain(pipeline);
                    for (candidate, _) in &deltas {
                        if let Err(e) = self.model_pool.apply_plan(*candidate, &self.planner.current_plan()) {
                            warn!("failed to apply reallocated plan for {candidate}: {e}");
                        }
                    }
                }
            } else {
                runtime.quiet_ticks.store(0, Ordering::SeqCst);
            }
            self.emit_progress(pipeline);
        }
    }
}
