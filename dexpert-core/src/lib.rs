#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod cache;
pub mod catalog;
pub mod checkpoint;
pub mod convert;
pub mod device_map;
pub mod engine;
mod error;
mod host;
pub mod lora;
pub mod memory;
pub mod models;
pub mod noise;
pub mod pipeline;
pub mod schedule;
pub mod sd;
pub mod settings;
mod util;
mod worker;

pub use device_map::*;
pub use engine::{Engine, EngineOptions, ErrorReport, GenerationOutcome, RequestState};
pub use error::{Error, ErrorKind, Result};
pub use host::{CancellationToken, Host, LogHost};
pub use lora::AdapterSpec;
pub use pipeline::{ExtraInputs, GenerationMode};
pub use sd::CandleFactory;
pub use settings::Settings;
pub use util::*;

use serde::{Deserialize, Serialize};

const DEFAULT_SIZE: usize = 512;
const DEFAULT_STEPS: usize = 25;
const DEFAULT_GUIDANCE: f64 = 7.5;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    #[serde(default)]
    pub mode: GenerationMode,
    /// Checkpoint file name, resolved against the model directories.
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
    pub batch_size: Option<usize>,
    pub variation_seed: Option<u64>,
    pub variation_strength: Option<f32>,
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    #[serde(default)]
    pub use_lcm_lora: bool,
    #[serde(default)]
    pub use_tiny_vae: bool,
    /// Overrides the `scheduler` setting for this request.
    pub scheduler: Option<String>,
    /// ControlNet models to condition on. The candle backbone takes no extra
    /// residuals, so any entry fails the request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controlnets: Vec<String>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::default(),
            model: model.into(),
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: None,
            height: None,
            steps: None,
            guidance: None,
            seed: None,
            batch_size: None,
            variation_seed: None,
            variation_strength: None,
            adapters: Vec::new(),
            use_lcm_lora: false,
            use_tiny_vae: false,
            scheduler: None,
            controlnets: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width.unwrap_or(DEFAULT_SIZE)
    }

    pub fn height(&self) -> usize {
        self.height.unwrap_or(DEFAULT_SIZE)
    }

    pub fn steps(&self) -> usize {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    pub fn guidance(&self) -> f64 {
        self.guidance.unwrap_or(DEFAULT_GUIDANCE)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(1).max(1)
    }

    /// Negative prompts shorter than two characters count as empty.
    pub fn effective_negative_prompt(&self) -> &str {
        if self.negative_prompt.trim().chars().count() < 2 {
            ""
        } else {
            &self.negative_prompt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_fill_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"model": "a.safetensors", "prompt": "a cat", "negative_prompt": "x"}"#).unwrap();
        assert_eq!(request.mode, GenerationMode::Txt2Img);
        assert_eq!((request.width(), request.height(), request.steps()), (512, 512, 25));
        assert_eq!(request.batch_size(), 1);
        assert_eq!(request.effective_negative_prompt(), "");

        let request = GenerationRequest {
            negative_prompt: "blurry".into(),
            ..GenerationRequest::new("a", "b")
        };
        assert_eq!(request.effective_negative_prompt(), "blurry");
    }
}
