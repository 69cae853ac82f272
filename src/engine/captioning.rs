//! Captioning adapters. The local adapter simulates a multimodal LLM and
//! supports precomputing a reusable image embedding so N prompts can run
//! against one image without re-encoding; the HTTP adapter proxies to an
//! OpenAI-compatible chat completions endpoint.

use std::time::Duration as StdDuration;

use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::config::HttpCaptionConfig;
use crate::error::EngineError;
use crate::model::ResultWrite;

use super::{simulated_hash, EngineInput, InferenceEngine, Instance};

/// A precomputed per-image encoding, reusable across multiple prompts.
/// Captioning-specific capability, not part of the base [`InferenceEngine`]
/// contract because the other three pipelines have no analogous concept.
pub trait ReusableImageContext {
    fn encode_image(&self, bytes: &[u8]) -> Result<ImageContext, EngineError>;
    fn caption_with(&self, context: &ImageContext, prompt: &str) -> Result<CaptionResult, EngineError>;
}

/// Owns a handle to the encoded representation; releases it on drop.
pub struct ImageContext {
    digest: u64,
}

impl Drop for ImageContext {
    fn drop(&mut self) {}
}

pub struct CaptionResult {
    pub text: String,
}

struct CaptionInstance {
    device: usize,
    last_used_at: DateTime<Utc>,
    provider: CaptionProvider,
}

enum CaptionProvider {
    Local,
    Http(HttpCaptionConfig),
}

impl Instance for CaptionInstance {
    fn infer_batch(&mut self, inputs: &[EngineInput]) -> Result<Vec<ResultWrite>, EngineError> {
        self.touch();
        inputs
            .iter()
            .map(|input| {
                let prompt = "Describe this image in one sentence.";
                let text = match &self.provider {
                    CaptionProvider::Local => simulate_caption(&input.bytes, prompt),
                    CaptionProvider::Http(cfg) => http_caption(cfg, &input.bytes, prompt)?,
                };
                Ok(ResultWrite::Caption {
                    image_id: input.image_id,
                    text,
                    source: match &self.provider {
                        CaptionProvider::Local => "sim-captioner-v1".to_string(),
                        CaptionProvider::Http(cfg) => cfg.model.clone(),
                    },
                    prompt: prompt.to_string(),
                })
            })
            .collect()
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

fn simulate_caption(bytes: &[u8], prompt: &str) -> String {
    let hash = simulated_hash(bytes);
    let subjects = ["a quiet street", "a mountain range", "a cat", "a group of people", "a plate of food"];
    let subject = subjects[(hash as usize) % subjects.len()];
    format!("In response to \"{prompt}\": an image depicting {subject}.")
}

fn http_caption(cfg: &HttpCaptionConfig, bytes: &[u8], prompt: &str) -> Result<String, EngineError> {
    let data_url = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    );
    let client = reqwest::blocking::Client::builder()
        .timeout(StdDuration::from_secs(cfg.timeout_seconds))
        .build()
        .map_err(|e| EngineError::BackendError(format!("http client build failed: {e}")))?;

    let mut request = client.post(format!("{}/chat/completions", cfg.base_url)).json(&serde_json::json!({
        "model": cfg.model,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": data_url}},
            ],
        }],
    }));
    if let Some(key) = &cfg.api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .map_err(|e| EngineError::BackendError(format!("http caption request failed: {e}")))?;
    if !response.status().is_success() {
        return Err(EngineError::BackendError(format!(
            "http caption backend returned {}",
            response.status()
        )));
    }
    let body: serde_json::Value = response
        .json()
        .map_err(|e| EngineError::BackendError(format!("invalid http caption response: {e}")))?;
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| EngineError::BackendError("missing content in caption response".to_string()))
}

/// Deterministic local multimodal captioner.
#[derive(Default)]
pub struct LocalCaptionEngine;

impl InferenceEngine for LocalCaptionEngine {
    fn estimate_vram_bytes(&self, _device: usize) -> u64 {
        6 * 1024 * 1024 * 1024
    }

    fn load(&self, device: usize) -> Result<Box<dyn Instance>, EngineError> {
        Ok(Box::new(CaptionInstance {
            device,
            last_used_at: Utc::now(),
            provider: CaptionProvider::Local,
        }))
    }
}

impl ReusableImageContext for LocalCaptionEngine {
    fn encode_image(&self, bytes: &[u8]) -> Result<ImageContext, EngineError> {
        Ok(ImageContext {
            digest: simulated_hash(bytes),
        })
    }

    fn caption_with(&self, context: &ImageContext, prompt: &str) -> Result<CaptionResult, EngineError> {
        let subjects = ["a quiet street", "a mountain range", "a cat", "a group of people", "a plate of food"];
        let subject = subjects[(context.digest as usize) % subjects.len()];
        Ok(CaptionResult {
            text: format!("In response to \"{prompt}\": an image depicting {subject}."),
        })
    }
}

/// HTTP-backed captioner: `load`/`unload` are no-ops, `estimate_vram` is 0
/// since no local VRAM is consumed.
pub struct HttpCaptionEngine {
    config: HttpCaptionConfig,
}

impl HttpCaptionEngine {
    pub fn new(config: HttpCaptionConfig) -> Self {
        Self { config }
    }
}

impl InferenceEngine for HttpCaptionEngine {
    fn estimate_vram_bytes(&self, _device: usize) -> u64 {
        0
    }

    fn load(&self, device: usize) -> Result<Box<dyn Instance>, EngineError> {
        Ok(Box::new(CaptionInstance {
            device,
            last_used_at: Utc::now(),
            provider: CaptionProvider::Http(self.config.clone()),
        }))
    }
}
