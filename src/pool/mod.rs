//! C4 — Model Pool: owns loaded [`Instance`]s per `(pipeline, device)` slot
//! and hands them out to workers under exclusive ownership. Grounded on the
//! project's own worker-pool bookkeeping: atomic counters plus a
//! `dashmap`-indexed instance table, and an RAII release guard rather than a
//! caller-managed checkout/checkin pair.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::{InferenceEngine, Instance};
use crate::error::PoolError;
use crate::model::PipelineKind;
use crate::vram::PlacementPlan;

struct Slot {
    device: usize,
    instance: Option<Box<dyn Instance>>,
    in_use: bool,
}

struct PipelineState {
    engine: Arc<dyn InferenceEngine>,
    slots: Mutex<Vec<Slot>>,
    idle_ttl_minutes: i64,
}

struct ModelPoolInner {
    pipelines: DashMap<PipelineKind, PipelineState>,
    notify: Notify,
}

impl ModelPoolInner {
    fn return_instance(&self, pipeline: PipelineKind, slot_index: usize, mut instance: Box<dyn Instance>) {
        instance.touch();
        if let Some(state) = self.pipelines.get(&pipeline) {
            let mut slots = state.slots.lock();
            if slot_index < slots.len() {
                if state.idle_ttl_minutes == 0 && pipeline == PipelineKind::Captioning {
                    instance.unload();
                    slots[slot_index].instance = None;
                } else {
                    slots[slot_index].instance = Some(instance);
                }
                slots[slot_index].in_use = false;
            }
        }
        self.notify.notify_waiters();
    }
}

/// Exclusive checkout of a loaded instance. Returns the instance to the pool
/// on drop (or via the explicit [`AcquiredInstance::close`]).
pub struct AcquiredInstance {
    pool: Arc<ModelPoolInner>,
    pipeline: PipelineKind,
    slot_index: usize,
    instance: Option<Box<dyn Instance>>,
}

impl AcquiredInstance {
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.return_instance(self.pipeline, self.slot_index, instance);
        }
    }
}

impl Deref for AcquiredInstance {
    type Target = dyn Instance;
    fn deref(&self) -> &Self::Target {
        self.instance.as_deref().expect("instance taken before drop")
    }
}

impl DerefMut for AcquiredInstance {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.instance.as_deref_mut().expect("instance taken before drop")
    }
}

impl Drop for AcquiredInstance {
    fn drop(&mut self) {
        self.release();
    }
}

/// For each `(pipeline, device)` slot, maintains up to `plan[pipeline][device]`
/// loaded instances and arbitrates exclusive access across workers.
pub struct ModelPool {
    inner: Arc<ModelPoolInner>,
}

impl ModelPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ModelPoolInner {
                pipelines: DashMap::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn register_engine(
        &self,
        pipeline: PipelineKind,
        engine: Arc<dyn InferenceEngine>,
        idle_ttl_minutes: i64,
    ) {
        self.inner.pipelines.insert(
            pipeline,
            PipelineState {
                engine,
                slots: Mutex::new(Vec::new()),
                idle_ttl_minutes,
            },
        );
    }

    /// Differentially applies `plan` for `pipeline`: loads new instances
    /// eagerly, unloads excess instances once they are free.
    pub fn apply_plan(&self, pipeline: PipelineKind, plan: &PlacementPlan) -> Result<(), PoolError> {
        let target = plan.for_pipeline(pipeline);
        let state = self
            .inner
            .pipelines
            .get(&pipeline)
            .ok_or(PoolError::ShuttingDown)?;

        let mut slots = state.slots.lock();
        let mut counts_by_device: HashMap<usize, u32> = HashMap::new();
        for slot in slots.iter() {
            *counts_by_device.entry(slot.device).or_insert(0) += 1;
        }

        for (&device, &wanted) in &target {
            let have = counts_by_device.get(&device).copied().unwrap_or(0);
            for _ in have..wanted {
                let instance = state.engine.load(device)?;
                slots.push(Slot {
                    device,
                    instance: Some(instance),
                    in_use: false,
                });
            }
        }

        let devices: Vec<usize> = counts_by_device.keys().copied().collect();
        for device in devices {
            let wanted = target.get(&device).copied().unwrap_or(0);
            let have = counts_by_device.get(&device).copied().unwrap_or(0);
            if have <= wanted {
                continue;
            }
            let mut to_remove = have - wanted;
            let mut i = 0;
            while i < slots.len() && to_remove > 0 {
                if slots[i].device == device && !slots[i].in_use {
                    if let Some(mut instance) = slots[i].instance.take() {
                        instance.unload();
                    }
                    slots.remove(i);
                    to_remove -= 1;
                } else {
                    i += 1;
                }
            }
        }

        Ok(())
    }

    /// Selects any device where `pipeline` has a free, loaded slot
    /// (least-recently-used device preferred), waiting up to `timeout` if
    /// none is free.
    pub async fn acquire(
        &self,
        pipeline: PipelineKind,
        timeout: StdDuration,
    ) -> Result<AcquiredInstance, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some((slot_index, instance)) = self.try_take(pipeline) {
                return Ok(AcquiredInstance {
                    pool: self.inner.clone(),
                    pipeline,
                    slot_index,
                    instance: Some(instance),
                });
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::AcquireTimeout);
            }
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    fn try_take(&self, pipeline: PipelineKind) -> Option<(usize, Box<dyn Instance>)> {
        let state = self.inner.pipelines.get(&pipeline)?;
        let mut slots = state.slots.lock();

        let mut candidates: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use && s.instance.is_some())
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| {
            slots[i]
                .instance
                .as_ref()
                .map(|inst| inst.last_used_at())
                .unwrap_or_else(Utc::now)
        });

        let chosen = candidates.into_iter().next()?;
        slots[chosen].in_use = true;
        let instance = slots[chosen].instance.take()?;
        Some((chosen, instance))
    }

    /// Count of slots currently checked out by a worker, for the
    /// worker-pool-occupancy metric.
    pub fn occupancy(&self, pipeline: PipelineKind) -> usize {
        self.inner
            .pipelines
            .get(&pipeline)
            .map(|state| state.slots.lock().iter().filter(|slot| slot.in_use).count())
            .unwrap_or(0)
    }

    /// Idle-TTL sweep for pipelines with a bounded `idle_ttl_minutes`
    /// (captioning, typically). `ttl < 0` disables eviction.
    pub fn sweep_idle(&self) {
        let now = Utc::now();
        for entry in self.inner.pipelines.iter() {
            let state = entry.value();
            if state.idle_ttl_minutes < 0 {
                continue;
            }
            let mut slots = state.slots.lock();
            for slot in slots.iter_mut() {
                if slot.in_use {
                    continue;
                }
                let expired = slot
                    .instance
                    .as_ref()
                    .map(|i| (now - i.last_used_at()).num_minutes() >= state.idle_ttl_minutes)
                    .unwrap_or(false);
                if expired {
                    if let Some(mut instance) = slot.instance.take() {
                        instance.unload();
                    }
                }
            }
        }
    }

    pub fn release_all(&self) {
        for entry in self.inner.pipelines.iter() {
            let mut slots = entry.value().slots.lock();
            for slot in slots.iter_mut() {
                if let Some(mut instance) = slot.instance.take() {
                    instance.unload();
                }
            }
            slots.clear();
        }
    }
}

impl Default for ModelPool {
    fn default() -> Self {
        Self::new()
    }
}
