//! C6 — Queue Manager: the policy layer over [`CatalogStore`] implementing
//! folder enqueue with skip-already-processed semantics, priority-now
//! elevation, and the periodic claim-expiry sweep.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use log::debug;

use crate::catalog::CatalogStore;
use crate::config::Config;
use crate::error::CatalogError;
use crate::model::{ImageId, PipelineKind};

/// Priority used by "process now" / "embed now" / "caption now" requests.
pub const PRIORITY_NOW: i64 = 100;
pub const PRIORITY_NORMAL: i64 = 0;

pub struct QueueManager {
    catalog: Arc<dyn CatalogStore>,
    claim_ttl: ChronoDuration,
    skip_already_processed: std::collections::HashMap<PipelineKind, bool>,
}

impl QueueManager {
    pub fn new(catalog: Arc<dyn CatalogStore>, config: &Config) -> Self {
        let skip_already_processed = PipelineKind::ALL
            .iter()
            .map(|&p| (p, config.skip_already_processed_for(p)))
            .collect();
        Self {
            catalog,
            claim_ttl: ChronoDuration::seconds(config.claim_ttl_seconds as i64),
            skip_already_processed,
        }
    }

    pub fn claim_ttl(&self) -> ChronoDuration {
        self.claim_ttl
    }

    /// Direct enqueue of known image ids; idempotent, raises priority only.
    pub fn enqueue_images(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
        priority: i64,
    ) -> Result<usize, CatalogError> {
        let filtered = self.filter_already_processed(pipeline, image_ids)?;
        if filtered.is_empty() {
            return Ok(0);
        }
        self.catalog.enqueue(pipeline, &filtered, priority)
    }

    /// Resolves `folder_id` to image ids through the catalog and enqueues
    /// the subset that still needs `pipeline`, honoring the tri-state
    /// `needs_<pipeline>` flag when `skip_already_processed` is on.
    pub fn enqueue_folder(
        &self,
        pipeline: PipelineKind,
        folder_id: &str,
        recursive: bool,
        priority: i64,
    ) -> Result<usize, CatalogError> {
        self.catalog.enqueue_folder(pipeline, folder_id, recursive, priority)
    }

    /// "Process now": elevates priority to [`PRIORITY_NOW`]. The caller is
    /// responsible for requesting the orchestrator transition the pipeline
    /// to Running if it was Stopped/Paused.
    pub fn process_now(&self, pipeline: PipelineKind, image_ids: &[ImageId]) -> Result<usize, CatalogError> {
        self.catalog.enqueue(pipeline, image_ids, PRIORITY_NOW)
    }

    fn filter_already_processed(
        &self,
        pipeline: PipelineKind,
        image_ids: &[ImageId],
    ) -> Result<Vec<ImageId>, CatalogError> {
        let skip = self.skip_already_processed.get(&pipeline).copied().unwrap_or(true);
        if !skip {
            return Ok(image_ids.to_vec());
        }
        let mut result = Vec::with_capacity(image_ids.len());
        for &id in image_ids {
            let image = self.catalog.get_image(id)?;
            match image.needs(pipeline) {
                Some(false) => continue,
                _ => result.push(id),
            }
        }
        Ok(result)
    }

    /// Releases expired claims for every pipeline; intended to be invoked on
    /// a periodic sweep by the orchestrator.
    pub fn sweep_expired_claims(&self) -> Result<usize, CatalogError> {
        let mut total = 0;
        for pipeline in PipelineKind::ALL {
            let released = self.catalog.release_expired_claims(pipeline)?;
            if released > 0 {
                debug!("{pipeline}: released {released} expired claims");
            }
            total += released;
        }
        Ok(total)
    }
}
