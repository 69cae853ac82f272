//! C2 — InferenceEngine adapters: the uniform contract over ONNX-style
//! tagging/embedding/face-detection backends and multimodal captioning
//! backends. This module ships deterministic simulated adapters behind the
//! same trait surface a real ONNX Runtime/LLM client would implement.

mod captioning;
mod simulated;

pub use captioning::{HttpCaptionEngine, LocalCaptionEngine, ReusableImageContext};
pub use simulated::{EmbeddingEngine, FaceDetectionEngine, TaggingEngine};

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::model::ResultWrite;

/// One decoded input handed to `infer_batch`: raw image bytes plus the
/// catalog image id they belong to (outputs must echo this ordering).
#[derive(Debug, Clone)]
pub struct EngineInput {
    pub image_id: crate::model::ImageId,
    pub bytes: Vec<u8>,
}

/// A loaded, VRAM-resident model instance. Exclusively owned by one caller
/// for the duration of a batch; returned to the [`crate::pool::ModelPool`]
/// between batches.
pub trait Instance: Send {
    fn infer_batch(&mut self, inputs: &[EngineInput]) -> Result<Vec<ResultWrite>, EngineError>;
    fn unload(&mut self);
    fn last_used_at(&self) -> DateTime<Utc>;
    fn touch(&mut self);
    fn device(&self) -> usize;
}

/// Uniform contract implemented by every pipeline's backend adapter.
pub trait InferenceEngine: Send + Sync {
    fn estimate_vram_bytes(&self, device: usize) -> u64;

    fn load(&self, device: usize) -> Result<Box<dyn Instance>, EngineError>;
}

pub(crate) fn simulated_hash(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
