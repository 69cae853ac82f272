//! C5 — Worker Pool: per-pipeline async worker tasks that pull claimed work
//! from the [`crate::catalog::CatalogStore`], run it through a
//! [`crate::pool::ModelPool`]-managed instance, and write results back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use log::{debug, error, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::catalog::CatalogStore;
use crate::engine::EngineInput;
use crate::error::ErrorKind;
use crate::model::{PipelineKind, QueueEntry};
use crate::pool::ModelPool;

/// Cooperative pause/stop signal shared between the orchestrator and every
/// worker task of one pipeline. Closed (`false`) blocks new batch claims;
/// open workers finish their in-flight batch before re-checking.
#[derive(Clone)]
pub struct Gate {
    open: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl Gate {
    pub fn new_open() -> Self {
        Self {
            open: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Suspends the caller until the gate opens. Returns immediately if
    /// already open.
    pub async fn wait_until_open(&self) {
        while !self.is_open() {
            self.notify.notified().await;
        }
    }
}

/// Counters a worker reports back to the orchestrator for progress events.
#[derive(Default)]
pub struct WorkerCounters {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
}

/// Callback surface the worker loop needs from the orchestrator without
/// holding a direct reference to it (keeps ownership acyclic).
#[async_trait::async_trait]
pub trait WorkerHost: Send + Sync {
    fn gate(&self, pipeline: PipelineKind) -> Gate;
    /// Reads image bytes for inference; in production this decodes/loads the
    /// file, in tests it can synthesize bytes.
    async fn load_image_bytes(&self, image_id: crate::model::ImageId) -> std::io::Result<Vec<u8>>;
    fn on_fatal(&self, pipeline: PipelineKind, reason: String);
}

pub struct WorkerPoolConfig {
    pub batch_size: usize,
    pub claim_ttl: ChronoDuration,
    pub max_attempts: u32,
    pub acquire_timeout: StdDuration,
    pub idle_backoff: StdDuration,
}

/// Spawns and owns the tokio tasks for one pipeline's worker fleet.
pub struct WorkerFleet {
    handles: Vec<JoinHandle<()>>,
    pub counters: Arc<WorkerCounters>,
}

impl WorkerFleet {
    pub fn spawn(
        pipeline: PipelineKind,
        worker_count: usize,
        catalog: Arc<dyn CatalogStore>,
        model_pool: Arc<ModelPool>,
        host: Arc<dyn WorkerHost>,
        config: Arc<WorkerPoolConfig>,
    ) -> Self {
        let counters = Arc::new(WorkerCounters::default());
        let handles = (0..worker_count.max(1))
            .map(|i| {
                let worker_id = format!("{}-{}", pipeline.as_str(), i);
                tokio::spawn(worker_loop(
                    pipeline,
                    worker_id,
                    catalog.clone(),
                    model_pool.clone(),
                    host.clone(),
                    config.clone(),
                    counters.clone(),
                ))
            })
            .collect();
        Self { handles, counters }
    }

    /// Aborts every worker task and waits for them to unwind. Abort happens
    /// at the task's next await point, which still runs local destructors
    /// (notably [`crate::pool::AcquiredInstance`]'s release-on-drop), so an
    /// in-flight acquire is returned to the pool even under cancellation.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    pipeline: PipelineKind,
    worker_id: String,
    catalog: Arc<dyn CatalogStore>,
    model_pool: Arc<ModelPool>,
    host: Arc<dyn WorkerHost>,
    config: Arc<WorkerPoolConfig>,
    counters: Arc<WorkerCounters>,
) {
    let mut consecutive_backend_failures = 0u32;
    loop {
        let gate = host.gate(pipeline);
        gate.wait_until_open().await;
        if !gate.is_open() {
            continue;
        }

        let mut batch = match catalog.claim_batch(pipeline, &worker_id, config.batch_size, config.claim_ttl) {
            Ok(b) => b,
            Err(e) => {
                warn!("{worker_id}: claim_batch failed: {e}");
                tokio::time::sleep(config.idle_backoff).await;
                continue;
            }
        };

        if batch.is_empty() {
            let fallback_ids = match catalog.list_images_needing(pipeline, config.batch_size) {
                Ok(ids) => ids,
                Err(_) => Vec::new(),
            };
            if fallback_ids.is_empty() {
                tokio::time::sleep(config.idle_backoff).await;
                continue;
            }
            batch = match catalog.enqueue_and_claim(pipeline, &fallback_ids, 0, &worker_id, config.claim_ttl) {
                Ok(b) => b,
                Err(_) => {
                    tokio::time::sleep(config.idle_backoff).await;
                    continue;
                }
            };
            if batch.is_empty() {
                tokio::time::sleep(config.idle_backoff).await;
                continue;
            }
        }

        let batch_ids: Vec<_> = batch.iter().map(|e| e.id).collect();
        match run_batch(pipeline, &batch, &catalog, &model_pool, &host, &config).await {
            Ok(()) => {
                consecutive_backend_failures = 0;
                let _ = catalog.ack(&batch_ids);
                counters.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(kind) => handle_batch_error(
                kind,
                pipeline,
                &batch,
                &batch_ids,
                &catalog,
                &host,
                &config,
                &counters,
                &mut consecutive_backend_failures,
            )
            .await,
        }
    }
}

async fn run_batch(
    pipeline: PipelineKind,
    batch: &[QueueEntry],
    catalog: &Arc<dyn CatalogStore>,
    model_pool: &Arc<ModelPool>,
    host: &Arc<dyn WorkerHost>,
    config: &Arc<WorkerPoolConfig>,
) -> Result<(), ErrorKind> {
    let mut inputs = Vec::with_capacity(batch.len());
    for entry in batch {
        let bytes = host
            .load_image_bytes(entry.image_id)
            .await
            .map_err(|_| ErrorKind::BadInput)?;
        inputs.push(EngineInput {
            image_id: entry.image_id,
            bytes,
        });
    }

    let instance = model_pool
        .acquire(pipeline, config.acquire_timeout)
        .await
        .map_err(|e| e.kind())?;

    let (instance, result) = tokio::task::spawn_blocking(move || {
        let mut instance = instance;
        let outputs = instance.infer_batch(&inputs);
        (instance, outputs)
    })
    .await
    .expect("inference worker task panicked");
    instance.close();
    let outputs = result.map_err(|e| e.kind())?;

    for output in outputs {
        catalog.write_result(output).map_err(|e| e.kind())?;
    }
    debug!("{} batch of {} entries written", pipeline, batch.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_batch_error(
    kind: ErrorKind,
    pipeline: PipelineKind,
    batch: &[QueueEntry],
    batch_ids: &[crate::model::QueueEntryId],
    catalog: &Arc<dyn CatalogStore>,
    host: &Arc<dyn WorkerHost>,
    config: &Arc<WorkerPoolConfig>,
    counters: &Arc<WorkerCounters>,
    consecutive_backend_failures: &mut u32,
) {
    match kind {
        ErrorKind::Transient | ErrorKind::InsufficientVram => {
            let _ = catalog.fail(batch_ids, true, config.max_attempts, &kind.to_string());
            counters.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            let jitter_ms = fastrand::u64(0..250);
            tokio::time::sleep(StdDuration::from_millis(200 + jitter_ms)).await;
        }
        ErrorKind::BackendError => {
            *consecutive_backend_failures += 1;
            let _ = catalog.fail(batch_ids, true, config.max_attempts, &kind.to_string());
            counters.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            if *consecutive_backend_failures >= 2 {
                warn!("{pipeline}: instance failed twice consecutively, will reload on next acquire");
                *consecutive_backend_failures = 0;
            }
            tokio::time::sleep(config.idle_backoff).await;
        }
        ErrorKind::BadInput => {
            let _ = catalog.fail(batch_ids, false, config.max_attempts, "bad input");
            counters.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        ErrorKind::Cancelled => {
            let _ = catalog.fail(batch_ids, true, config.max_attempts, "cancelled");
        }
        ErrorKind::Fatal => {
            let _ = catalog.fail(batch_ids, false, config.max_attempts, "fatal");
            counters.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            error!("{pipeline}: fatal error, stopping pipeline");
            host.on_fatal(pipeline, "fatal backend error".to_string());
        }
    }
}

pub fn default_config_for(batch_size: usize, claim_ttl_seconds: u64, max_attempts: u32) -> WorkerPoolConfig {
    WorkerPoolConfig {
        batch_size,
        claim_ttl: ChronoDuration::seconds(claim_ttl_seconds as i64),
        max_attempts,
        acquire_timeout: StdDuration::from_secs(30),
        idle_backoff: StdDuration::from_millis(500),
    }
}

pub fn worker_counts_from_plan(plan: &HashMap<usize, u32>) -> usize {
    plan.values().sum::<u32>().max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_blocks_until_opened() {
        let gate = Gate::new_open();
        gate.close();
        assert!(!gate.is_open());

        let gate_clone = gate.clone();
        let waiter = tokio::spawn(async move {
            gate_clone.wait_until_open().await;
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        gate.open();
        tokio::time::timeout(StdDuration::from_millis(200), waiter)
            .await
            .expect("wait_until_open should return promptly after open()")
            .unwrap();
    }
}
