//! Deterministic stand-ins for real ONNX sessions. Each adapter derives its
//! output from byte statistics of the input so tests get stable, repeatable
//! results without a GPU.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::model::{FaceRecord, ResultWrite};

use super::{simulated_hash, EngineInput, InferenceEngine, Instance};

const TAG_VOCABULARY: &[&str] = &[
    "outdoor", "portrait", "landscape", "night", "macro", "animal", "architecture", "text",
];

struct SimInstance {
    device: usize,
    last_used_at: DateTime<Utc>,
    infer: fn(&EngineInput) -> ResultWrite,
}

impl Instance for SimInstance {
    fn infer_batch(&mut self, inputs: &[EngineInput]) -> Result<Vec<ResultWrite>, EngineError> {
        self.touch();
        Ok(inputs.iter().map(self.infer).collect())
    }

    fn unload(&mut self) {}

    fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }

    fn device(&self) -> usize {
        self.device
    }
}

fn tag_one(input: &EngineInput) -> ResultWrite {
    let hash = simulated_hash(&input.bytes);
    let tags = TAG_VOCABULARY
        .iter()
        .enumerate()
        .filter(|(i, _)| (hash >> i) & 1 == 1)
        .map(|(i, name)| (name.to_string(), 0.5 + 0.5 * ((hash.rotate_left(i as u32) % 100) as f32 / 100.0)))
        .collect();
    ResultWrite::TagList {
        image_id: input.image_id,
        tags,
        source: "sim-tagger-v1".to_string(),
    }
}

fn embed_one(input: &EngineInput) -> ResultWrite {
    let hash = simulated_hash(&input.bytes);
    let mut vector = Vec::with_capacity(32);
    let mut state = hash;
    for _ in 0..32 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        vector.push(((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0);
    }
    let mut vectors = std::collections::HashMap::new();
    vectors.insert("clip-sim-32d".to_string(), vector);
    ResultWrite::Embeddings {
        image_id: input.image_id,
        vectors,
        embedding_source_id: None,
    }
}

fn detect_faces_one(input: &EngineInput) -> ResultWrite {
    let hash = simulated_hash(&input.bytes);
    let face_count = (hash % 3) as usize;
    let faces = (0..face_count)
        .map(|i| {
            let seed = hash.rotate_left(i as u32 * 7);
            FaceRecord {
                bbox: (
                    (seed % 100) as f32 / 100.0,
                    ((seed >> 8) % 100) as f32 / 100.0,
                    0.2,
                    0.2,
                ),
                quality: 0.6 + ((seed >> 16) % 40) as f32 / 100.0,
                crop: Vec::new(),
                embedding: [0.0; 512],
                group_id: None,
            }
        })
        .collect();
    ResultWrite::Faces {
        image_id: input.image_id,
        faces,
    }
}

macro_rules! simulated_engine {
    ($name:ident, $cost_mb:expr, $infer_fn:ident) => {
        pub struct $name {
            cost_bytes: u64,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    cost_bytes: $cost_mb * 1024 * 1024,
                }
            }
        }

        impl InferenceEngine for $name {
            fn estimate_vram_bytes(&self, _device: usize) -> u64 {
                self.cost_bytes
            }

            fn load(&self, device: usize) -> Result<Box<dyn Instance>, EngineError> {
                Ok(Box::new(SimInstance {
                    device,
                    last_used_at: Utc::now(),
                    infer: $infer_fn,
                }))
            }
        }
    };
}

simulated_engine!(TaggingEngine, 900, tag_one);
simulated_engine!(EmbeddingEngine, 1200, embed_one);
simulated_engine!(FaceDetectionEngine, 600, detect_faces_one);
