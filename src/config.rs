//! Persistent orchestrator configuration, loaded from / saved to a JSON file
//! on disk. Mirrors the project's own `CliConfig::load`/`save` pattern.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{CaptionHandlingMode, PipelineKind};

/// Per-device instance counts, e.g. `"2,1"` => `[2, 1]` (device 0 gets 2
/// instances, device 1 gets 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationVector(pub Vec<u32>);

impl AllocationVector {
    pub fn parse(s: &str) -> Result<Self, String> {
        let counts = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|e| format!("invalid allocation count {part:?}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AllocationVector(counts))
    }

    pub fn get(&self, device_idx: usize) -> u32 {
        self.0.get(device_idx).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCaptionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for HttpCaptionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "local-vlm".to_string(),
            api_key: None,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionProvider {
    Local,
    Http,
}

/// Top-level orchestrator configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub devices: Vec<usize>,
    pub vram_capacity_gb: HashMap<usize, f64>,
    pub max_vram_usage_pct: u8,

    pub concurrent_allocation: HashMap<PipelineKindKey, AllocationVector>,
    pub solo_allocation: HashMap<PipelineKindKey, AllocationVector>,
    pub enable_dynamic_vram: bool,

    pub batch_size: HashMap<PipelineKindKey, usize>,
    pub max_attempts: u32,
    pub claim_ttl_seconds: u64,
    pub claim_sweep_interval_seconds: u64,
    pub drain_grace_seconds: u64,

    pub captioning_model_ttl_minutes: i64,
    pub skip_already_processed: HashMap<PipelineKindKey, bool>,
    pub auto_on_scan: HashMap<PipelineKindKey, bool>,

    pub caption_handling_mode: CaptionHandlingMode,
    pub caption_provider: CaptionProvider,
    pub http_caption: HttpCaptionConfig,

    pub log_level: String,
    pub http_bind_addr: String,
}

/// `HashMap` keys must be `Eq + Hash + Serialize`; `PipelineKind` already is,
/// this newtype serializes/deserializes as its pipeline name string so it is
/// usable as a JSON object key (serde_json rejects struct-typed map keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKindKey(pub PipelineKind);

impl From<PipelineKind> for PipelineKindKey {
    fn from(p: PipelineKind) -> Self {
        PipelineKindKey(p)
    }
}

impl serde::Serialize for PipelineKindKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for PipelineKindKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let pipeline = match s.as_str() {
            "tagging" => PipelineKind::Tagging,
            "captioning" => PipelineKind::Captioning,
            "embedding" => PipelineKind::Embedding,
            "face_detection" => PipelineKind::FaceDetection,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unknown pipeline kind {other:?}"
                )))
            }
        };
        Ok(PipelineKindKey(pipeline))
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut vram_capacity_gb = HashMap::new();
        vram_capacity_gb.insert(0, 24.0);

        let mut concurrent_allocation = HashMap::new();
        let mut solo_allocation = HashMap::new();
        let mut batch_size = HashMap::new();
        let mut skip_already_processed = HashMap::new();
        let mut auto_on_scan = HashMap::new();

        for pipeline in PipelineKind::ALL {
            concurrent_allocation.insert(pipeline.into(), AllocationVector(vec![1]));
            solo_allocation.insert(pipeline.into(), AllocationVector(vec![2]));
            skip_already_processed.insert(pipeline.into(), true);
            auto_on_scan.insert(pipeline.into(), true);
        }
        batch_size.insert(PipelineKind::Tagging.into(), 16);
        batch_size.insert(PipelineKind::Embedding.into(), 16);
        batch_size.insert(PipelineKind::FaceDetection.into(), 4);
        batch_size.insert(PipelineKind::Captioning.into(), 1);

        Self {
            devices: vec![0],
            vram_capacity_gb,
            max_vram_usage_pct: 85,
            concurrent_allocation,
            solo_allocation,
            enable_dynamic_vram: true,
            batch_size,
            max_attempts: 3,
            claim_ttl_seconds: 300,
            claim_sweep_interval_seconds: 30,
            drain_grace_seconds: 10,
            captioning_model_ttl_minutes: 5,
            skip_already_processed,
            auto_on_scan,
            caption_handling_mode: CaptionHandlingMode::Overwrite,
            caption_provider: CaptionProvider::Local,
            http_caption: HttpCaptionConfig::default(),
            log_level: "info".to_string(),
            http_bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size_for(&self, pipeline: PipelineKind) -> usize {
        self.batch_size.get(&pipeline.into()).copied().unwrap_or(8)
    }

    pub fn skip_already_processed_for(&self, pipeline: PipelineKind) -> bool {
        self.skip_already_processed
            .get(&pipeline.into())
            .copied()
            .unwrap_or(true)
    }

    pub fn auto_on_scan_for(&self, pipeline: PipelineKind) -> bool {
        self.auto_on_scan.get(&pipeline.into()).copied().unwrap_or(false)
    }

    /// Default on-disk location: `$XDG_CONFIG_HOME/enrich-orchestrator/config.json`.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            let app_config = config_dir.join("enrich-orchestrator");
            let _ = fs::create_dir_all(&app_config);
            app_config.join("config.json")
        } else {
            PathBuf::from(".enrich-orchestrator.json")
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let config_path = path.map(|p| p.to_path_buf()).unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)
            .map_err(|e| format!("failed to read config file {config_path:?}: {e}"))?;

        serde_json::from_str(&contents)
            .map_err(|e| format!("failed to parse config file {config_path:?}: {e}"))
    }

    pub fn save(&self, path: Option<&Path>) -> Result<(), String> {
        let config_path = path.map(|p| p.to_path_buf()).unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create config directory: {e}"))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize config: {e}"))?;

        fs::write(&config_path, contents).map_err(|e| format!("failed to write config file: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_device() {
        let config = Config::default();
        assert_eq!(config.devices, vec![0]);
        assert_eq!(config.max_vram_usage_pct, 85);
    }

    #[test]
    fn allocation_vector_parses_comma_separated_counts() {
        let v = AllocationVector::parse("2,1").unwrap();
        assert_eq!(v.0, vec![2, 1]);
        assert_eq!(v.get(0), 2);
        assert_eq!(v.get(1), 1);
        assert_eq!(v.get(5), 0);
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::new();
        config.max_vram_usage_pct = 70;
        config.save(Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.max_vram_usage_pct, 70);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.max_vram_usage_pct, Config::default().max_vram_usage_pct);
    }
}
