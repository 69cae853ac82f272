//! Data model shared across every subsystem: pipeline kinds, queue entries,
//! worker snapshots, content fingerprints, and result payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One of the four inference pipelines this orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipelineKind {
    Tagging,
    FaceDetection,
    Embedding,
    Captioning,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Tagging,
        PipelineKind::FaceDetection,
        PipelineKind::Embedding,
        PipelineKind::Captioning,
    ];

    /// Ascending priority for dynamic VRAM reallocation: ties within the same
    /// rank (Tagging/FaceDetection) are broken by first-request order by the
    /// caller, not by this ordinal.
    pub fn reallocation_rank(self) -> u8 {
        match self {
            PipelineKind::Tagging | PipelineKind::FaceDetection => 0,
            PipelineKind::Embedding => 1,
            PipelineKind::Captioning => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::Tagging => "tagging",
            PipelineKind::Captioning => "captioning",
            PipelineKind::Embedding => "embedding",
            PipelineKind::FaceDetection => "face_detection",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-pipeline worker lifecycle state (see orchestrator state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped)
    }

    /// Whether instances owned by this pipeline should be kept loaded.
    pub fn holds_vram(self) -> bool {
        matches!(
            self,
            WorkerState::Starting
                | WorkerState::Running
                | WorkerState::Pausing
                | WorkerState::Paused
        )
    }
}

/// The subset of `WorkerState` a user can request directly; persisted as the
/// pipeline's `desired_state` and restored on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Running,
    Paused,
    Stopped,
}

/// Queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Claimed,
    Failed,
}

pub type ImageId = u64;
pub type QueueEntryId = u64;

/// One row of pending work for `(image_id, pipeline)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub image_id: ImageId,
    pub pipeline: PipelineKind,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: EntryStatus,
    pub claim_token: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Pending => true,
            EntryStatus::Claimed => self
                .claim_expires_at
                .map(|exp| exp <= now)
                .unwrap_or(false),
            EntryStatus::Failed => false,
        }
    }
}

/// Priority-then-FIFO ordering key: higher priority first, then older first.
pub fn claim_order_key(entry: &QueueEntry) -> (std::cmp::Reverse<i64>, DateTime<Utc>) {
    (std::cmp::Reverse(entry.priority), entry.enqueued_at)
}

/// Persisted per-pipeline lifecycle + counters, owned exclusively by the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub pipeline: PipelineKind,
    pub desired_state: DesiredState,
    pub last_changed_at: DateTime<Utc>,
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_ever_enqueued: u64,
    pub last_error_kind: Option<String>,
}

impl WorkerSnapshot {
    pub fn new(pipeline: PipelineKind) -> Self {
        Self {
            pipeline,
            desired_state: DesiredState::Stopped,
            last_changed_at: Utc::now(),
            processed: 0,
            failed: 0,
            skipped: 0,
            total_ever_enqueued: 0,
            last_error_kind: None,
        }
    }
}

/// Inputs normalized and hashed to detect content-identical generations.
#[derive(Debug, Clone, Default)]
pub struct FingerprintInputs {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model_id: Option<String>,
    pub seed: Option<i64>,
    pub sampler: Option<String>,
    pub steps: Option<u32>,
    pub cfg: Option<String>,
    pub size: Option<(u32, u32)>,
}

/// Stable SHA-256 hash over a normalized tuple of generation parameters.
/// `None` when no generation metadata is present on the image at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint(pub [u8; 32]);

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl ContentFingerprint {
    pub fn compute(inputs: &FingerprintInputs) -> Option<Self> {
        if inputs.prompt.is_none()
            && inputs.model_id.is_none()
            && inputs.seed.is_none()
            && inputs.sampler.is_none()
        {
            return None;
        }
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}|{:?}",
            inputs.prompt.as_deref().unwrap_or(""),
            inputs.negative_prompt.as_deref().unwrap_or(""),
            inputs.model_id.as_deref().unwrap_or(""),
            inputs.seed.unwrap_or(0),
            inputs.sampler.as_deref().unwrap_or(""),
            inputs.steps.unwrap_or(0),
            inputs.cfg.as_deref().unwrap_or(""),
            inputs.size.unwrap_or((0, 0)),
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Some(ContentFingerprint(out))
    }
}

/// A set of images sharing the same [`ContentFingerprint`].
#[derive(Debug, Clone)]
pub struct ImageGroup {
    pub fingerprint: ContentFingerprint,
    pub members: Vec<ImageId>,
    pub representative_image_id: ImageId,
    pub embedding_source_id: Option<ImageId>,
}

/// Registry row for one catalog image.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: ImageId,
    pub path: String,
    pub file_size: u64,
    pub fingerprint: Option<ContentFingerprint>,
    pub needs_tagging: Option<bool>,
    pub needs_captioning: Option<bool>,
    pub needs_embedding: Option<bool>,
    pub needs_face_detection: Option<bool>,
}

impl Image {
    pub fn needs(&self, pipeline: PipelineKind) -> Option<bool> {
        match pipeline {
            PipelineKind::Tagging => self.needs_tagging,
            PipelineKind::Captioning => self.needs_captioning,
            PipelineKind::Embedding => self.needs_embedding,
            PipelineKind::FaceDetection => self.needs_face_detection,
        }
    }
}

/// How a caption write should be merged with any existing caption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionHandlingMode {
    Overwrite,
    Append,
    Refine,
}

/// A detected/recognized face, written by the FaceDetection pipeline.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub bbox: (f32, f32, f32, f32),
    pub quality: f32,
    pub crop: Vec<u8>,
    pub embedding: [f32; 512],
    pub group_id: Option<String>,
}

/// Union of result payloads a worker writes back to the catalog.
#[derive(Debug, Clone)]
pub enum ResultWrite {
    TagList {
        image_id: ImageId,
        tags: Vec<(String, f32)>,
        source: String,
    },
    Caption {
        image_id: ImageId,
        text: String,
        source: String,
        prompt: String,
    },
    Embeddings {
        image_id: ImageId,
        vectors: std::collections::HashMap<String, Vec<f32>>,
        embedding_source_id: Option<ImageId>,
    },
    Faces {
        image_id: ImageId,
        faces: Vec<FaceRecord>,
    },
}

impl ResultWrite {
    pub fn image_id(&self) -> ImageId {
        match self {
            ResultWrite::TagList { image_id, .. }
            | ResultWrite::Caption { image_id, .. }
            | ResultWrite::Embeddings { image_id, .. }
            | ResultWrite::Faces { image_id, .. } => *image_id,
        }
    }
}

/// Audit record for a `Failed` queue entry.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub image_id: ImageId,
    pub pipeline: PipelineKind,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub attempt_count: u32,
}

/// Live progress snapshot the orchestrator broadcasts to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub pipeline: PipelineKind,
    pub state: WorkerState,
    pub queue_depth: u64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub throughput_per_minute: f64,
    pub eta_seconds: Option<f64>,
    pub vram_used_gb: f64,
}
