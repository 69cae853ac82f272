//! C3 — VRAM Planner: derives per-device instance-count plans from the
//! configured allocation vectors and a hard per-device VRAM ceiling, and
//! reshuffles those plans as pipelines start, drain, and stop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::{AllocationVector, Config};
use crate::error::EngineError;
use crate::model::PipelineKind;

/// For each pipeline, how many instances to run on each device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementPlan {
    pub counts: HashMap<PipelineKind, HashMap<usize, u32>>,
}

impl PlacementPlan {
    pub fn for_pipeline(&self, pipeline: PipelineKind) -> HashMap<usize, u32> {
        self.counts.get(&pipeline).cloned().unwrap_or_default()
    }

    pub fn total_for_pipeline(&self, pipeline: PipelineKind) -> u32 {
        self.for_pipeline(pipeline).values().sum()
    }

    fn set(&mut self, pipeline: PipelineKind, device: usize, count: u32) {
        let entry = self.counts.entry(pipeline).or_default();
        if count == 0 {
            entry.remove(&device);
        } else {
            entry.insert(device, count);
        }
    }
}

struct RunningPipeline {
    started_at: DateTime<Utc>,
}

/// Tracks per-device VRAM usage and produces/mutates [`PlacementPlan`]s as
/// pipelines move through the orchestrator's state machine.
pub struct VramPlanner {
    devices: Vec<usize>,
    capacity_bytes: HashMap<usize, u64>,
    ceiling_pct: u8,
    dynamic_enabled: bool,
    model_cost_bytes: HashMap<PipelineKind, u64>,
    concurrent_allocation: HashMap<PipelineKind, AllocationVector>,
    solo_allocation: HashMap<PipelineKind, AllocationVector>,

    plan: RwLock<PlacementPlan>,
    running: RwLock<HashMap<PipelineKind, RunningPipeline>>,
}

impl VramPlanner {
    pub fn new(config: &Config, model_cost_bytes: HashMap<PipelineKind, u64>) -> Self {
        let capacity_bytes = config
            .vram_capacity_gb
            .iter()
            .map(|(&device, &gb)| (device, (gb * 1024.0 * 1024.0 * 1024.0) as u64))
            .collect();
        let concurrent_allocation = config
            .concurrent_allocation
            .iter()
            .map(|(k, v)| (k.0, v.clone()))
            .collect();
        let solo_allocation = config
            .solo_allocation
            .iter()
            .map(|(k, v)| (k.0, v.clone()))
            .collect();

        Self {
            devices: config.devices.clone(),
            capacity_bytes,
            ceiling_pct: config.max_vram_usage_pct,
            dynamic_enabled: config.enable_dynamic_vram,
            model_cost_bytes,
            concurrent_allocation,
            solo_allocation,
            plan: RwLock::new(PlacementPlan::default()),
            running: RwLock::new(HashMap::new()),
        }
    }

    fn ceiling_bytes(&self, device: usize) -> u64 {
        let capacity = self.capacity_bytes.get(&device).copied().unwrap_or(0);
        capacity * self.ceiling_pct as u64 / 100
    }

    fn used_bytes_excluding(&self, plan: &PlacementPlan, device: usize, excl: PipelineKind) -> u64 {
        plan.counts
            .iter()
            .filter(|(&pipeline, _)| pipeline != excl)
            .filter_map(|(&pipeline, devices)| {
                devices.get(&device).map(|&count| {
                    count as u64 * self.model_cost_bytes.get(&pipeline).copied().unwrap_or(0)
                })
            })
            .sum()
    }

    fn used_bytes(&self, plan: &PlacementPlan, device: usize) -> u64 {
        plan.counts
            .iter()
            .filter_map(|(&pipeline, devices)| {
                devices.get(&device).map(|&count| {
                    count as u64 * self.model_cost_bytes.get(&pipeline).copied().unwrap_or(0)
                })
            })
            .sum()
    }

    /// Proportionally floors `vector` per-device until every device's total
    /// (including already-placed pipelines) fits the ceiling. The
    /// highest-capacity device absorbs any remainder from integer flooring.
    fn fit_to_ceiling(
        &self,
        pipeline: PipelineKind,
        vector: &AllocationVector,
        base_plan: &PlacementPlan,
    ) -> HashMap<usize, u32> {
        let cost = self.model_cost_bytes.get(&pipeline).copied().unwrap_or(0);
        let mut result = HashMap::new();
        if cost == 0 {
            for (i, &device) in self.devices.iter().enumerate() {
                result.insert(device, vector.get(i));
            }
            return result;
        }

        let mut scale: f64 = 1.0;
        for (i, &device) in self.devices.iter().enumerate() {
            let requested = vector.get(i) as u64;
            if requested == 0 {
                continue;
            }
            let used = self.used_bytes_excluding(base_plan, device, pipeline);
            let ceiling = self.ceiling_bytes(device);
            let available = ceiling.saturating_sub(used);
            let max_fit = available / cost;
            if max_fit < requested {
                scale = scale.min(max_fit as f64 / requested as f64);
            }
        }

        let highest_capacity_device = self
            .devices
            .iter()
            .max_by_key(|&&d| self.capacity_bytes.get(&d).copied().unwrap_or(0))
            .copied();

        let mut total_requested = 0u32;
        let mut total_floored = 0u32;
        for (i, &device) in self.devices.iter().enumerate() {
            let requested = vector.get(i);
            total_requested += requested;
            let floored = (requested as f64 * scale).floor() as u32;
            total_floored += floored;
            result.insert(device, floored);
        }

        if scale < 1.0 && total_floored < total_requested {
            if let Some(device) = highest_capacity_device {
                let used = self.used_bytes_excluding(base_plan, device, pipeline);
                let ceiling = self.ceiling_bytes(device);
                let available = ceiling.saturating_sub(used);
                let current = *result.get(&device).unwrap_or(&0);
                let max_fit = (available / cost) as u32;
                if current < max_fit {
                    result.insert(device, current + 1);
                }
            }
        }

        result
    }

    /// Computes the plan a pipeline should run under given which other
    /// pipelines are currently running, without mutating planner state.
    pub fn plan_for_start(&self, pipeline: PipelineKind) -> Result<HashMap<usize, u32>, EngineError> {
        let running = self.running.read();
        let base_plan = self.plan.read();
        let solo = self.dynamic_enabled && running.is_empty();
        let vector = if solo {
            self.solo_allocation.get(&pipeline)
        } else {
            self.concurrent_allocation.get(&pipeline)
        };
        let vector = vector.cloned().unwrap_or(AllocationVector(vec![0; self.devices.len()]));

        let fitted = self.fit_to_ceiling(pipeline, &vector, &base_plan);
        if fitted.values().all(|&c| c == 0) && vector.0.iter().any(|&c| c > 0) {
            return Err(EngineError::InsufficientVram {
                device: self.devices.first().copied().unwrap_or(0),
                requested_mb: self.model_cost_bytes.get(&pipeline).copied().unwrap_or(0) / (1024 * 1024),
                available_mb: 0,
            });
        }
        Ok(fitted)
    }

    /// Commits a plan for `pipeline` and marks it running.
    pub fn commit_start(&self, pipeline: PipelineKind, counts: HashMap<usize, u32>) {
        let mut plan = self.plan.write();
        for (&device, &count) in &counts {
            plan.set(pipeline, device, count);
        }
        self.running.write().insert(pipeline, RunningPipeline { started_at: Utc::now() });
    }

    pub fn commit_stop(&self, pipeline: PipelineKind) {
        let mut plan = self.plan.write();
        for &device in &self.devices {
            plan.set(pipeline, device, 0);
        }
        self.running.write().remove(&pipeline);
    }

    pub fn current_plan(&self) -> PlacementPlan {
        self.plan.read().clone()
    }

    /// Priority order used both for `on_drain` growth and for starter-side
    /// shrinkage: Captioning first, then Embedding, then Tagging/FaceDetection.
    fn priority_ordered_running(&self, exclude: PipelineKind) -> Vec<PipelineKind> {
        let running = self.running.read();
        let mut pipelines: Vec<PipelineKind> = running
            .keys()
            .copied()
            .filter(|&p| p != exclude)
            .collect();
        pipelines.sort_by_key(|&p| {
            let rank = match p {
                PipelineKind::Captioning => 0,
                PipelineKind::Embedding => 1,
                PipelineKind::Tagging | PipelineKind::FaceDetection => 2,
            };
            (rank, running.get(&p).map(|r| r.started_at).unwrap_or_else(Utc::now))
        });
        pipelines
    }

    /// On drain of `pipeline`: release its VRAM, then grow still-running
    /// pipelines toward their solo allocation in priority order, clamped to
    /// the freed budget. Returns the deltas to apply via the Model Pool.
    pub fn on_drain(&self, pipeline: PipelineKind) -> Vec<(PipelineKind, HashMap<usize, u32>)> {
        if !self.dynamic_enabled {
            return Vec::new();
        }
        self.commit_stop(pipeline);

        let mut deltas = Vec::new();
        for candidate in self.priority_ordered_running(pipeline) {
            let base_plan = self.plan.read().clone();
            let current = base_plan.for_pipeline(candidate);
            let solo_vector = self
                .solo_allocation
                .get(&candidate)
                .cloned()
                .unwrap_or(AllocationVector(vec![0; self.devices.len()]));
            let fitted_solo = self.fit_to_ceiling(candidate, &solo_vector, &base_plan);

            let mut new_counts = HashMap::new();
            let mut any_growth = false;
            for &device in &self.devices {
                let cur = current.get(&device).copied().unwrap_or(0);
                let target = fitted_solo.get(&device).copied().unwrap_or(0);
                let grown = target.max(cur);
                if grown > cur {
                    any_growth = true;
                }
                new_counts.insert(device, grown);
            }
            if any_growth {
                let mut plan = self.plan.write();
                for (&device, &count) in &new_counts {
                    plan.set(candidate, device, count);
                }
                deltas.push((candidate, new_counts));
            }
        }
        deltas
    }

    /// When a new pipeline wants to start while dynamic reallocation has
    /// grown others past their concurrent baseline, shrink them back first.
    pub fn shrink_for_admission(&self, starting: PipelineKind) -> Vec<(PipelineKind, HashMap<usize, u32>)> {
        if !self.dynamic_enabled {
            return Vec::new();
        }
        let mut deltas = Vec::new();
        for candidate in self.priority_ordered_running(starting) {
            let current = self.plan.read().for_pipeline(candidate);
            let concurrent_vector = self
                .concurrent_allocation
                .get(&candidate)
                .cloned()
                .unwrap_or(AllocationVector(vec![0; self.devices.len()]));

            let mut new_counts = HashMap::new();
            let mut any_shrink = false;
            for (i, &device) in self.devices.iter().enumerate() {
                let cur = current.get(&device).copied().unwrap_or(0);
                let target = concurrent_vector.get(i).min(cur);
                if target < cur {
                    any_shrink = true;
                }
                new_counts.insert(device, target);
            }
            if any_shrink {
                let mut plan = self.plan.write();
                for (&device, &count) in &new_counts {
                    plan.set(candidate, device, count);
                }
                deltas.push((candidate, new_counts));
            }
        }
        deltas
    }

    pub fn used_gb(&self, device: usize) -> f64 {
        self.used_bytes(&self.plan.read(), device) as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner_with(devices: Vec<usize>, capacity_gb: f64, cost_mb: u64) -> VramPlanner {
        let mut config = Config::default();
        config.devices = devices.clone();
        config.vram_capacity_gb = devices.iter().map(|&d| (d, capacity_gb)).collect();
        let mut costs = HashMap::new();
        for pipeline in PipelineKind::ALL {
            costs.insert(pipeline, cost_mb * 1024 * 1024);
        }
        VramPlanner::new(&config, costs)
    }

    #[test]
    fn solo_allocation_used_when_nothing_else_running() {
        let planner = planner_with(vec![0], 24.0, 900);
        let plan = planner.plan_for_start(PipelineKind::Tagging).unwrap();
        assert_eq!(plan.get(&0).copied().unwrap_or(0), 2);
    }

    #[test]
    fn plan_shrinks_proportionally_when_it_would_exceed_ceiling() {
        let planner = planner_with(vec![0], 1.0, 900);
        let plan = planner.plan_for_start(PipelineKind::Tagging).unwrap();
        let ceiling_bytes = (1.0 * 1024.0 * 1024.0 * 1024.0 * 0.85) as u64;
        let used = plan.get(&0).copied().unwrap_or(0) as u64 * 900 * 1024 * 1024;
        assert!(used <= ceiling_bytes);
    }

    #[test]
    fn on_drain_grows_remaining_pipeline_toward_solo() {
        let planner = planner_with(vec![0], 24.0, 900);
        let tagging_plan = planner.plan_for_start(PipelineKind::Tagging).unwrap();
        planner.commit_start(PipelineKind::Tagging, tagging_plan);

        let embedding_plan = planner.plan_for_start(PipelineKind::Embedding).unwrap();
        planner.commit_start(PipelineKind::Embedding, embedding_plan);

        let before = planner.current_plan().total_for_pipeline(PipelineKind::Embedding);
        let deltas = planner.on_drain(PipelineKind::Tagging);
        assert!(!deltas.is_empty());
        let after = planner.current_plan().total_for_pipeline(PipelineKind::Embedding);
        assert!(after >= before);
    }

    #[test]
    fn disabled_dynamic_reallocation_makes_on_drain_a_noop() {
        let mut config = Config::default();
        config.devices = vec![0];
        config.vram_capacity_gb.insert(0, 24.0);
        config.enable_dynamic_vram = false;
        let mut costs = HashMap::new();
        for pipeline in PipelineKind::ALL {
            costs.insert(pipeline, 900 * 1024 * 1024);
        }
        let planner = VramPlanner::new(&config, costs);
        let plan = planner.plan_for_start(PipelineKind::Tagging).unwrap();
        // Config::default() sets concurrent_allocation=[1], solo_allocation=[2];
        // with dynamic reallocation disabled, even a solo start must use the
        // concurrent count.
        assert_eq!(plan.get(&0).copied().unwrap_or(0), 1);
        planner.commit_start(PipelineKind::Tagging, plan);
        assert!(planner.on_drain(PipelineKind::Tagging).is_empty());
    }
}
