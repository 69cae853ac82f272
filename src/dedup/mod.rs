//! C7 — Deduplication Engine. Applies only to the Embedding pipeline: images
//! sharing a [`ContentFingerprint`] are grouped, and only the group's
//! representative is ever run through inference; results are copied
//! write-through to the other members.

use std::sync::Arc;

use log::debug;

use crate::catalog::CatalogStore;
use crate::error::CatalogError;
use crate::model::{ContentFingerprint, Image, ImageGroup, ImageId, PipelineKind, ResultWrite};

pub struct DeduplicationEngine {
    catalog: Arc<dyn CatalogStore>,
}

/// What the caller should do with an image after deduplication has run.
pub enum EnqueueDecision {
    /// No group membership possible (no fingerprint); enqueue `image_id` as-is.
    EnqueueDirectly,
    /// Embeddings already available from the group's source; no inference needed.
    Skipped,
    /// Enqueue this image id instead (the group's current representative).
    /// `superseded`, if set, names a previous representative whose now-stale
    /// Pending queue entry the caller must retract so at most one inference
    /// ever runs per group.
    EnqueueRepresentative {
        image_id: ImageId,
        superseded: Option<ImageId>,
    },
}

impl DeduplicationEngine {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Resolves what to enqueue (if anything) for `image_id` against the
    /// Embedding pipeline, grouping by content fingerprint.
    pub fn resolve_enqueue(&self, image_id: ImageId) -> Result<EnqueueDecision, CatalogError> {
        let image = self.catalog.get_image(image_id)?;
        let fingerprint = match image.fingerprint {
            Some(fp) => fp,
            None => return Ok(EnqueueDecision::EnqueueDirectly),
        };

        let existing = self.catalog.get_group(fingerprint)?;
        let mut group = match existing {
            Some(group) => group,
            None => {
                let group = ImageGroup {
                    fingerprint,
                    members: vec![image_id],
                    representative_image_id: image_id,
                    embedding_source_id: None,
                };
                self.catalog.upsert_group(group.clone())?;
                return Ok(EnqueueDecision::EnqueueRepresentative {
                    image_id,
                    superseded: None,
                });
            }
        };

        if let Some(source_id) = group.embedding_source_id {
            if let Ok(source_image) = self.catalog.get_image(source_id) {
                if source_image.needs(PipelineKind::Embedding) == Some(false) {
                    self.catalog.mark_needs(PipelineKind::Embedding, &[image_id], false)?;
                    debug!("dedup: copying embeddings from {source_id} to {image_id}");
                    return Ok(EnqueueDecision::Skipped);
                }
            }
        }

        let previous_representative = group.representative_image_id;
        if !group.members.contains(&image_id) {
            group.members.push(image_id);
        }
        let representative = self.pick_representative(&group.members)?;
        group.representative_image_id = representative;
        self.catalog.upsert_group(group)?;

        let superseded = if representative != previous_representative {
            Some(previous_representative)
        } else {
            None
        };
        Ok(EnqueueDecision::EnqueueRepresentative {
            image_id: representative,
            superseded,
        })
    }

    /// Largest-file-size rule; ties broken lexicographically by path.
    fn pick_representative(&self, members: &[ImageId]) -> Result<ImageId, CatalogError> {
        let mut best: Option<Image> = None;
        for &id in members {
            let candidate = self.catalog.get_image(id)?;
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    if candidate.file_size > current.file_size
                        || (candidate.file_size == current.file_size && candidate.path < current.path)
                    {
                        candidate
                    } else {
                        current
                    }
                }
            });
        }
        Ok(best.map(|i| i.id).unwrap_or(members[0]))
    }

    /// On an Embedding result write: marks the group's source, then
    /// write-through copies `needs_embedding=false` to every other member.
    pub fn on_embedding_result(&self, result: &ResultWrite) -> Result<(), CatalogError> {
        let ResultWrite::Embeddings { image_id, .. } = result else {
            return Ok(());
        };
        let image = self.catalog.get_image(*image_id)?;
        let Some(fingerprint) = image.fingerprint else {
            return Ok(());
        };
        let Some(mut group) = self.catalog.get_group(fingerprint)? else {
            return Ok(());
        };

        group.embedding_source_id = Some(*image_id);
        let others: Vec<ImageId> = group
            .members
            .iter()
            .copied()
            .filter(|&m| m != *image_id)
            .collect();
        self.catalog.upsert_group(group)?;
        if !others.is_empty() {
            self.catalog.mark_needs(PipelineKind::Embedding, &others, false)?;
        }
        Ok(())
    }

    /// Orphan handling: when `image_id` (the current representative) is
    /// reported missing, pick a new representative from the remaining
    /// members and return it for re-enqueue.
    pub fn reassign_representative(
        &self,
        fingerprint: ContentFingerprint,
        missing_image_id: ImageId,
    ) -> Result<Option<ImageId>, CatalogError> {
        let Some(mut group) = self.catalog.get_group(fingerprint)? else {
            return Ok(None);
        };
        group.members.retain(|&m| m != missing_image_id);
        if group.members.is_empty() {
            return Ok(None);
        }
        let new_representative = self.pick_representative(&group.members)?;
        group.representative_image_id = new_representative;
        if group.embedding_source_id == Some(missing_image_id) {
            group.embedding_source_id = None;
        }
        self.catalog.upsert_group(group)?;
        self.catalog
            .mark_needs(PipelineKind::Embedding, &[new_representative], true)?;
        Ok(Some(new_representative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalogStore;
    use crate::model::FingerprintInputs;

    fn fingerprint() -> ContentFingerprint {
        ContentFingerprint::compute(&FingerprintInputs {
            prompt: Some("a cat".into()),
            seed: Some(7),
            ..Default::default()
        })
        .unwrap()
    }

    fn seed_images(store: &MemoryCatalogStore, fp: ContentFingerprint) -> (ImageId, ImageId, ImageId) {
        let i3 = store.register_image(Image {
            id: 0,
            path: "/i3.png".into(),
            file_size: 500,
            fingerprint: Some(fp),
            needs_tagging: None,
            needs_captioning: None,
            needs_embedding: Some(true),
            needs_face_detection: None,
        });
        let i4 = store.register_image(Image {
            id: 0,
            path: "/i4.png".into(),
            file_size: 5000,
            fingerprint: Some(fp),
            needs_tagging: None,
            needs_captioning: None,
            needs_embedding: Some(true),
            needs_face_detection: None,
        });
        let i5 = store.register_image(Image {
            id: 0,
            path: "/i5.png".into(),
            file_size: 200,
            fingerprint: Some(fp),
            needs_tagging: None,
            needs_captioning: None,
            needs_embedding: Some(true),
            needs_face_detection: None,
        });
        (i3, i4, i5)
    }

    #[test]
    fn group_enqueues_only_the_largest_file() {
        let store = Arc::new(MemoryCatalogStore::new());
        let dedup = DeduplicationEngine::new(store.clone());
        let fp = fingerprint();
        let (i3, i4, i5) = seed_images(&store, fp);

        let d3 = dedup.resolve_enqueue(i3).unwrap();
        assert!(matches!(d3, EnqueueDecision::EnqueueRepresentative { image_id, .. } if image_id == i3));
        let d4 = dedup.resolve_enqueue(i4).unwrap();
        assert!(matches!(
            d4,
            EnqueueDecision::EnqueueRepresentative { image_id, superseded: Some(s) } if image_id == i4 && s == i3
        ));
        let d5 = dedup.resolve_enqueue(i5).unwrap();
        assert!(matches!(
            d5,
            EnqueueDecision::EnqueueRepresentative { image_id, superseded: None } if image_id == i4
        ));

        let group = store.get_group(fp).unwrap().unwrap();
        assert_eq!(group.representative_image_id, i4);
    }

    #[test]
    fn embedding_result_propagates_to_other_members() {
        let store = Arc::new(MemoryCatalogStore::new());
        let dedup = DeduplicationEngine::new(store.clone());
        let fp = fingerprint();
        let (i3, i4, i5) = seed_images(&store, fp);
        dedup.resolve_enqueue(i3).unwrap();
        dedup.resolve_enqueue(i4).unwrap();
        dedup.resolve_enqueue(i5).unwrap();

        let mut vectors = std::collections::HashMap::new();
        vectors.insert("clip".to_string(), vec![0.1, 0.2]);
        dedup
            .on_embedding_result(&ResultWrite::Embeddings {
                image_id: i4,
                vectors,
                embedding_source_id: None,
            })
            .unwrap();

        let decision = dedup.resolve_enqueue(i3).unwrap();
        assert!(matches!(decision, EnqueueDecision::Skipped));
        let i3_image = store.get_image(i3).unwrap();
        assert_eq!(i3_image.needs_embedding, Some(false));
    }

    #[test]
    fn orphaned_representative_reassigns() {
        let store = Arc::new(MemoryCatalogStore::new());
        let dedup = DeduplicationEngine::new(store.clone());
        let fp = fingerprint();
        let (i3, i4, i5) = seed_images(&store, fp);
        dedup.resolve_enqueue(i3).unwrap();
        dedup.resolve_enqueue(i4).unwrap();
        dedup.resolve_enqueue(i5).unwrap();

        let new_rep = dedup.reassign_representative(fp, i4).unwrap();
        assert_eq!(new_rep, Some(i3));
        let group = store.get_group(fp).unwrap().unwrap();
        assert_eq!(group.representative_image_id, i3);
        assert!(!group.members.contains(&i4));
    }
}
