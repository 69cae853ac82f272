use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::CatalogError;
use crate::model::{
    claim_order_key, ContentFingerprint, EntryStatus, FailedEntry, Image, ImageGroup, ImageId,
    PipelineKind, QueueEntry, QueueEntryId, ResultWrite,
};

use super::CatalogStore;

/// In-process reference [`CatalogStore`]: enough to run the full orchestrator
/// and its test scenarios without an external database.
pub struct MemoryCatalogStore {
    next_entry_id: AtomicU64,
    next_image_id: AtomicU64,
    claim_seq: AtomicU64,

    entries: DashMap<PipelineKind, Vec<QueueEntry>>,
    failed: DashMap<PipelineKind, Vec<FailedEntry>>,
    images: DashMap<ImageId, Image>,
    folders: DashMap<String, Vec<ImageId>>,
    groups: RwLock<HashMap<ContentFingerprint, ImageGroup>>,
}

impl Default for MemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self {
            next_entry_id: AtomicU64::new(1),
            next_image_id: AtomicU64::new(1),
            claim_seq: AtomicU64::new(1),
            entries: DashMap::new(),
            failed: DashMap::new(),
            images: DashMap::new(),
            folders: DashMap::new(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an image so tests and the watcher hook can seed the
    /// catalog before enqueueing work against it.
    pub fn register_image(&self, image: Image) -> ImageId {
        let id = if image.id == 0 {
            self.next_image_id.fetch_add(1, Ordering::SeqCst)
        } else {
            image.id
        };
        let mut image = image;
        image.id = id;
        self.images.insert(id, image);
        id
    }

    pub fn register_folder(&self, folder_id: &str, image_ids: Vec<ImageId>) {
        self.folders.insert(folder_id.to_string(), image_ids);
    }

    fn next_id(&self) -> QueueEntryId {
        self.next_entry_id.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue_locked(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
    ) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.entry(pipeline).or_default();
        let mut inserted = 0;
        for &image_id in image_ids {
            if let Some(existing) = entries
                .iter_mut()
                .find(|e| e.image_id == image_id && e.status != EntryStatus::Failed)
            {
                if priority > existing.priority {
                    existing.priority = priority;
                }
                continue;
            }
            entries.push(QueueEntry {
                id: self.next_id(),
                image_id,
                pipeline,
                priority,
                enqueued_at: now,
                attempt_count: 0,
                status: EntryStatus::Pending,
                claim_token: None,
                claim_expires_at: None,
            });
            inserted += 1;
        }
        inserted
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn enqueue(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
    ) -> Result<usize, CatalogError> {
        Ok(self.enqueue_locked(pipeline, image_ids, priority))
    }

    fn enqueue_folder(
        &self,
        pipeline: PipelineKind,
        folder_id: &str,
        _recursive: bool,
        priority: i64,
    ) -> Result<usize, CatalogError> {
        let image_ids = self
            .folders
            .get(folder_id)
            .map(|v| v.clone())
            .ok_or_else(|| CatalogError::NotFound(format!("folder {folder_id}")))?;
        Ok(self.enqueue_locked(pipeline, &image_ids, priority))
    }

    fn claim_batch(
        &self,
        pipeline: PipelineKind,
        worker_id: &str,
        max: usize,
        claim_ttl: Duration,
    ) -> Result<Vec<QueueEntry>, CatalogError> {
        let now = Utc::now();
        let mut entries = self.entries.entry(pipeline).or_default();

        let mut claimable_idx: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_claimable(now))
            .map(|(i, _)| i)
            .collect();
        claimable_idx.sort_by_key(|&i| claim_order_key(&entries[i]));
        claimable_idx.truncate(max);

        let token_prefix = format!("{worker_id}-{}", self.claim_seq.fetch_add(1, Ordering::SeqCst));
        let mut claimed = Vec::with_capacity(claimable_idx.len());
        for (n, idx) in claimable_idx.into_iter().enumerate() {
            let entry = &mut entries[idx];
            entry.status = EntryStatus::Claimed;
            entry.claim_token = Some(format!("{token_prefix}-{n}"));
            entry.claim_expires_at = Some(now + claim_ttl);
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    fn enqueue_and_claim(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
        worker_id: &str,
        claim_ttl: Duration,
    ) -> Result<Vec<QueueEntry>, CatalogError> {
        self.enqueue_locked(pipeline, image_ids, priority);
        self.claim_batch(pipeline, worker_id, image_ids.len(), claim_ttl)
    }

    fn ack(&self, ids: &[QueueEntryId]) -> Result<(), CatalogError> {
        for mut entries in self.entries.iter_mut() {
            entries.retain(|e| !ids.contains(&e.id));
        }
        Ok(())
    }

    fn fail(
        &self,
        ids: &[QueueEntryId],
        retriable: bool,
        max_attempts: u32,
        reason: &str,
    ) -> Result<(), CatalogError> {
        let now = Utc::now();
        for mut entries in self.entries.iter_mut() {
            let pipeline = *entries.key();
            let mut to_fail = Vec::new();
            for entry in entries.value_mut().iter_mut() {
                if !ids.contains(&entry.id) {
                    continue;
                }
                entry.attempt_count += 1;
                if !retriable || entry.attempt_count >= max_attempts {
                    entry.status = EntryStatus::Failed;
                    to_fail.push(FailedEntry {
                        image_id: entry.image_id,
                        pipeline,
                        reason: reason.to_string(),
                        failed_at: now,
                        attempt_count: entry.attempt_count,
                    });
                } else {
                    entry.status = EntryStatus::Pending;
                    entry.claim_token = None;
                    entry.claim_expires_at = None;
                }
            }
            if !to_fail.is_empty() {
                self.failed.entry(pipeline).or_default().extend(to_fail);
            }
        }
        Ok(())
    }

    fn release_expired_claims(&self, pipeline: PipelineKind) -> Result<usize, CatalogError> {
        let now = Utc::now();
        let mut entries = self.entries.entry(pipeline).or_default();
        let mut released = 0;
        for entry in entries.iter_mut() {
            if entry.status == EntryStatus::Claimed
                && entry.claim_expires_at.map(|exp| exp <= now).unwrap_or(false)
            {
                entry.status = EntryStatus::Pending;
                entry.claim_token = None;
                entry.claim_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    fn cancel_pending(&self, pipeline: PipelineKind, image_ids: &[ImageId]) -> Result<usize, CatalogError> {
        let mut entries = self.entries.entry(pipeline).or_default();
        let before = entries.len();
        entries.retain(|e| !(e.status == EntryStatus::Pending && image_ids.contains(&e.image_id)));
        Ok(before - entries.len())
    }

    fn clear(&self, pipeline: PipelineKind) -> Result<usize, CatalogError> {
        let mut entries = self.entries.entry(pipeline).or_default();
        let count = entries.len();
        entries.clear();
        self.failed.entry(pipeline).or_default().clear();
        Ok(count)
    }

    fn clear_all(&self) -> Result<usize, CatalogError> {
        let mut total = 0;
        for pipeline in PipelineKind::ALL {
            total += self.clear(pipeline)?;
        }
        Ok(total)
    }

    fn write_result(&self, result: ResultWrite) -> Result<(), CatalogError> {
        let image_id = result.image_id();
        let mut image = self
            .images
            .get_mut(&image_id)
            .ok_or_else(|| CatalogError::NotFound(format!("image {image_id}")))?;
        match result {
            ResultWrite::TagList { .. } => image.needs_tagging = Some(false),
            ResultWrite::Caption { .. } => image.needs_captioning = Some(false),
            ResultWrite::Embeddings { .. } => image.needs_embedding = Some(false),
            ResultWrite::Faces { .. } => image.needs_face_detection = Some(false),
        }
        Ok(())
    }

    fn mark_needs(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        value: bool,
    ) -> Result<(), CatalogError> {
        for &id in image_ids {
            if let Some(mut image) = self.images.get_mut(&id) {
                match pipeline {
                    PipelineKind::Tagging => image.needs_tagging = Some(value),
                    PipelineKind::Captioning => image.needs_captioning = Some(value),
                    PipelineKind::Embedding => image.needs_embedding = Some(value),
                    PipelineKind::FaceDetection => image.needs_face_detection = Some(value),
                }
            }
        }
        Ok(())
    }

    fn list_images_needing(
        &self,
        pipeline: PipelineKind,
        limit: usize,
    ) -> Result<Vec<ImageId>, CatalogError> {
        Ok(self
            .images
            .iter()
            .filter(|e| e.value().needs(pipeline) == Some(true))
            .take(limit)
            .map(|e| *e.key())
            .collect())
    }

    fn list_failed(&self, pipeline: PipelineKind) -> Result<Vec<FailedEntry>, CatalogError> {
        Ok(self.failed.get(&pipeline).map(|v| v.clone()).unwrap_or_default())
    }

    fn requeue_failed(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
    ) -> Result<usize, CatalogError> {
        let mut entries = self.entries.entry(pipeline).or_default();
        let mut requeued = 0;
        for entry in entries.iter_mut() {
            if entry.status == EntryStatus::Failed && image_ids.contains(&entry.image_id) {
                entry.status = EntryStatus::Pending;
                entry.attempt_count = 0;
                entry.claim_token = None;
                entry.claim_expires_at = None;
                requeued += 1;
            }
        }
        if let Some(mut failed) = self.failed.get_mut(&pipeline) {
            failed.retain(|f| !image_ids.contains(&f.image_id));
        }
        Ok(requeued)
    }

    fn get_image(&self, id: ImageId) -> Result<Image, CatalogError> {
        self.images
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| CatalogError::NotFound(format!("image {id}")))
    }

    fn get_group(
        &self,
        fingerprint: ContentFingerprint,
    ) -> Result<Option<ImageGroup>, CatalogError> {
        Ok(self.groups.read().get(&fingerprint).cloned())
    }

    fn upsert_group(&self, group: ImageGroup) -> Result<(), CatalogError> {
        self.groups.write().insert(group.fingerprint, group);
        Ok(())
    }

    fn find_by_fingerprint(
        &self,
        fingerprint: ContentFingerprint,
    ) -> Result<Option<ImageGroup>, CatalogError> {
        self.get_group(fingerprint)
    }

    fn queue_depth(&self, pipeline: PipelineKind) -> Result<u64, CatalogError> {
        Ok(self
            .entries
            .get(&pipeline)
            .map(|v| v.iter().filter(|e| e.status != EntryStatus::Failed).count())
            .unwrap_or(0) as u64)
    }

    fn has_active_claims(&self, pipeline: PipelineKind) -> Result<bool, CatalogError> {
        let now = Utc::now();
        Ok(self.entries.get(&pipeline).map(|v| {
            v.iter().any(|e| {
                e.status == EntryStatus::Claimed
                    && e.claim_expires_at.map(|exp| exp > now).unwrap_or(false)
            })
        }).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FingerprintInputs;

    fn store_with_images(n: usize) -> (MemoryCatalogStore, Vec<ImageId>) {
        let store = MemoryCatalogStore::new();
        let ids = (0..n)
            .map(|i| {
                store.register_image(Image {
                    id: 0,
                    path: format!("/img/{i}.png"),
                    file_size: 1000 + i as u64,
                    fingerprint: None,
                    needs_tagging: Some(true),
                    needs_captioning: Some(true),
                    needs_embedding: Some(true),
                    needs_face_detection: Some(true),
                })
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn claim_batch_never_double_claims() {
        let (store, ids) = store_with_images(5);
        store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();

        let first = store
            .claim_batch(PipelineKind::Tagging, "w1", 3, Duration::seconds(30))
            .unwrap();
        let second = store
            .claim_batch(PipelineKind::Tagging, "w2", 3, Duration::seconds(30))
            .unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        let first_ids: std::collections::HashSet<_> = first.iter().map(|e| e.image_id).collect();
        let second_ids: std::collections::HashSet<_> = second.iter().map(|e| e.image_id).collect();
        assert!(first_ids.is_disjoint(&second_ids));
    }

    #[test]
    fn claim_batch_respects_priority_then_fifo() {
        let (store, ids) = store_with_images(3);
        store.enqueue(PipelineKind::Tagging, &ids[0..1], 0).unwrap();
        store.enqueue(PipelineKind::Tagging, &ids[1..2], 10).unwrap();
        store.enqueue(PipelineKind::Tagging, &ids[2..3], 0).unwrap();

        let claimed = store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(30))
            .unwrap();
        assert_eq!(claimed[0].image_id, ids[1]);
    }

    #[test]
    fn enqueue_is_idempotent_and_keeps_higher_priority() {
        let (store, ids) = store_with_images(1);
        store.enqueue(PipelineKind::Tagging, &ids, 1).unwrap();
        let inserted = store.enqueue(PipelineKind::Tagging, &ids, 50).unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.queue_depth(PipelineKind::Tagging).unwrap(), 1);

        let claimed = store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(30))
            .unwrap();
        assert_eq!(claimed[0].priority, 50);
    }

    #[test]
    fn expired_claim_is_reclaimable() {
        let (store, ids) = store_with_images(1);
        store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();
        store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(-1))
            .unwrap();

        let released = store.release_expired_claims(PipelineKind::Tagging).unwrap();
        assert_eq!(released, 1);

        let reclaimed = store
            .claim_batch(PipelineKind::Tagging, "w2", 1, Duration::seconds(30))
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[test]
    fn fail_moves_entry_to_failed_after_max_attempts() {
        let (store, ids) = store_with_images(1);
        store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();
        let claimed = store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(30))
            .unwrap();

        store.fail(&[claimed[0].id], true, 2, "backend exploded").unwrap();
        assert_eq!(store.queue_depth(PipelineKind::Tagging).unwrap(), 1);

        let claimed_again = store
            .claim_batch(PipelineKind::Tagging, "w2", 1, Duration::seconds(30))
            .unwrap();
        store
            .fail(&[claimed_again[0].id], true, 2, "backend exploded again")
            .unwrap();

        let failed = store.list_failed(PipelineKind::Tagging).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(store.queue_depth(PipelineKind::Tagging).unwrap(), 0);
    }

    #[test]
    fn requeue_failed_resets_attempts() {
        let (store, ids) = store_with_images(1);
        store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();
        let claimed = store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(30))
            .unwrap();
        store.fail(&[claimed[0].id], false, 3, "bad input").unwrap();

        let requeued = store.requeue_failed(PipelineKind::Tagging, &ids).unwrap();
        assert_eq!(requeued, 1);
        assert!(store.list_failed(PipelineKind::Tagging).unwrap().is_empty());
    }

    #[test]
    fn ack_removes_entry_entirely() {
        let (store, ids) = store_with_images(1);
        store.enqueue(PipelineKind::Tagging, &ids, 0).unwrap();
        let claimed = store
            .claim_batch(PipelineKind::Tagging, "w1", 1, Duration::seconds(30))
            .unwrap();
        store.ack(&[claimed[0].id]).unwrap();
        assert_eq!(store.queue_depth(PipelineKind::Tagging).unwrap(), 0);
    }

    #[test]
    fn fingerprint_groups_round_trip() {
        let (store, ids) = store_with_images(2);
        let fp = ContentFingerprint::compute(&FingerprintInputs {
            prompt: Some("a cat".into()),
            seed: Some(42),
            ..Default::default()
        })
        .unwrap();
        store
            .upsert_group(ImageGroup {
                fingerprint: fp,
                members: ids.clone(),
                representative_image_id: ids[0],
                embedding_source_id: Some(ids[0]),
            })
            .unwrap();
        let found = store.find_by_fingerprint(fp).unwrap().unwrap();
        assert_eq!(found.representative_image_id, ids[0]);
    }
}
