//! Processing orchestrator for a multi-pipeline image indexing and
//! enrichment system: persistent per-pipeline priority queues, VRAM-budgeted
//! model pooling across GPUs, and a Start/Pause/Stop/Clear lifecycle for
//! four inference pipelines (tagging, captioning, embedding, face
//! detection).

pub mod catalog;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod vram;
pub mod workers;

pub use catalog::{CatalogStore, MemoryCatalogStore};
pub use config::Config;
pub use engine::InferenceEngine;
pub use error::{CatalogError, EngineError, ErrorKind, OrchestratorError, PoolError};
pub use model::{PipelineKind, WorkerState};
pub use orchestrator::Orchestrator;
