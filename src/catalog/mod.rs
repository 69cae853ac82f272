//! C1 — CatalogStore adapter: the single integration surface to the
//! persistent catalog (relational DB + vector index in production; an
//! in-process reference implementation here).

mod memory_store;

pub use memory_store::MemoryCatalogStore;

use chrono::{DateTime, Utc};

use crate::error::CatalogError;
use crate::model::{
    FailedEntry, Image, ImageGroup, ImageId, PipelineKind, QueueEntry, ResultWrite,
};

/// Abstract facade over persistent queues, the image registry, and pipeline
/// result writes. Every orchestration subsystem above this one talks only to
/// this trait, never to a concrete database client.
pub trait CatalogStore: Send + Sync {
    /// Idempotent w.r.t. `(image_id, pipeline)`: an existing Pending/Claimed
    /// entry keeps the higher of its current and the requested priority.
    fn enqueue(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
    ) -> Result<usize, CatalogError>;

    /// Expands `folder_id` to image ids (recursively if requested) and
    /// enqueues them with the same idempotence as [`Self::enqueue`].
    fn enqueue_folder(
        &self,
        pipeline: PipelineKind,
        folder_id: &str,
        recursive: bool,
        priority: i64,
    ) -> Result<usize, CatalogError>;

    /// Atomically claims up to `max` highest-priority Pending entries for
    /// `pipeline`. No two callers may ever receive the same entry.
    fn claim_batch(
        &self,
        pipeline: PipelineKind,
        worker_id: &str,
        max: usize,
        claim_ttl: chrono::Duration,
    ) -> Result<Vec<QueueEntry>, CatalogError>;

    /// Enqueues `image_ids` at `priority` and atomically claims them in the
    /// same call (used by the worker's needs-flag fallback path).
    fn enqueue_and_claim(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
        worker_id: &str,
        claim_ttl: chrono::Duration,
    ) -> Result<Vec<QueueEntry>, CatalogError>;

    fn ack(&self, ids: &[crate::model::QueueEntryId]) -> Result<(), CatalogError>;

    /// On retriable fail: reset to Pending, `attempt_count += 1`; if the new
    /// count reaches `max_attempts`, move to `Failed` instead.
    fn fail(
        &self,
        ids: &[crate::model::QueueEntryId],
        retriable: bool,
        max_attempts: u32,
        reason: &str,
    ) -> Result<(), CatalogError>;

    fn release_expired_claims(&self, pipeline: PipelineKind) -> Result<usize, CatalogError>;

    /// Removes a still-Pending entry for `(image_id, pipeline)`, if any.
    /// Used by the Deduplication Engine to retract a stale representative's
    /// queue entry when a group's representative changes before it is
    /// claimed. A no-op if the entry is already Claimed or absent.
    fn cancel_pending(&self, pipeline: PipelineKind, image_ids: &[ImageId]) -> Result<usize, CatalogError>;

    fn clear(&self, pipeline: PipelineKind) -> Result<usize, CatalogError>;
    fn clear_all(&self) -> Result<usize, CatalogError>;

    fn write_result(&self, result: ResultWrite) -> Result<(), CatalogError>;

    fn mark_needs(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        value: bool,
    ) -> Result<(), CatalogError>;

    /// Images flagged as still needing `pipeline` but not currently queued;
    /// consulted by workers when a queue drains.
    fn list_images_needing(
        &self,
        pipeline: PipelineKind,
        limit: usize,
    ) -> Result<Vec<ImageId>, CatalogError>;

    fn list_failed(&self, pipeline: PipelineKind) -> Result<Vec<FailedEntry>, CatalogError>;

    /// Resets `attempt_count` to 0 and clears the `Failed` row for each id.
    fn requeue_failed(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
    ) -> Result<usize, CatalogError>;

    fn get_image(&self, id: ImageId) -> Result<Image, CatalogError>;

    fn get_group(
        &self,
        fingerprint: crate::model::ContentFingerprint,
    ) -> Result<Option<ImageGroup>, CatalogError>;

    fn upsert_group(&self, group: ImageGroup) -> Result<(), CatalogError>;

    fn find_by_fingerprint(
        &self,
        fingerprint: crate::model::ContentFingerprint,
    ) -> Result<Option<ImageGroup>, CatalogError>;

    /// Pending/claimed queue depth for a pipeline (used by drain detection
    /// and progress events).
    fn queue_depth(&self, pipeline: PipelineKind) -> Result<u64, CatalogError>;

    /// Whether any entry for `pipeline` currently has a live (non-expired)
    /// claim.
    fn has_active_claims(&self, pipeline: PipelineKind) -> Result<bool, CatalogError>;

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
