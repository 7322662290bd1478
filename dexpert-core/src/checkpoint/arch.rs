//! Architecture description read from LDM-style inference YAML documents.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ArchConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub attention_resolutions: Vec<usize>,
    pub num_res_blocks: usize,
    pub num_heads: Option<usize>,
    pub num_head_channels: Option<usize>,
    pub transformer_depth: usize,
    pub context_dim: usize,
    pub linear_start: f64,
    pub linear_end: f64,
    pub timesteps: usize,
    pub scale_factor: f64,
    pub text_layers: usize,
    pub vae: VaeArch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VaeArch {
    pub ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub z_channels: usize,
}

impl ArchConfig {
    /// Built-in 1.x configuration, used when no YAML document is present.
    pub fn sd1(inpaint: bool) -> Self {
        Self {
            in_channels: if inpaint { 9 } else { 4 },
            out_channels: 4,
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            attention_resolutions: vec![4, 2, 1],
            num_res_blocks: 2,
            num_heads: Some(8),
            num_head_channels: None,
            transformer_depth: 1,
            context_dim: 768,
            linear_start: 0.00085,
            linear_end: 0.012,
            timesteps: 1000,
            scale_factor: 0.18215,
            text_layers: 12,
            vae: VaeArch {
                ch: 128,
                ch_mult: vec![1, 2, 4, 4],
                num_res_blocks: 2,
                z_channels: 4,
            },
        }
    }

    /// File name of the YAML document describing the 1.x variant.
    pub fn sd1_file_name(inpaint: bool) -> &'static str {
        if inpaint {
            "v1-inpainting-inference.yaml"
        } else {
            "v1-inference.yaml"
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let doc: LdmDocument = serde_yaml::from_str(source)
            .map_err(|e| Error::UnrecognizedArchitecture(format!("invalid config: {e}")))?;
        let params = doc.model.params;
        let unet = params.unet_config.params;
        let dd = params.first_stage_config.params.ddconfig;
        let config = Self {
            in_channels: unet.in_channels,
            out_channels: unet.out_channels,
            model_channels: unet.model_channels,
            channel_mult: unet.channel_mult,
            attention_resolutions: unet.attention_resolutions,
            num_res_blocks: unet.num_res_blocks,
            num_heads: positive(unet.num_heads),
            num_head_channels: positive(unet.num_head_channels),
            transformer_depth: unet.transformer_depth,
            context_dim: unet.context_dim,
            linear_start: params.linear_start,
            linear_end: params.linear_end,
            timesteps: params.timesteps,
            scale_factor: params.scale_factor,
            text_layers: params
                .cond_stage_config
                .map(|c| c.params.num_layers)
                .unwrap_or_else(default_text_layers),
            vae: VaeArch {
                ch: dd.ch,
                ch_mult: dd.ch_mult,
                num_res_blocks: dd.num_res_blocks,
                z_channels: dd.z_channels,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `dir/<name>` when present, else falls back to the built-in preset.
    pub fn sd1_from_dir(dir: &Path, inpaint: bool) -> Result<Self> {
        let path = dir.join(Self::sd1_file_name(inpaint));
        if !path.is_file() {
            return Ok(Self::sd1(inpaint));
        }
        tracing::debug!(path = %path.display(), "reading architecture config");
        Self::from_yaml(&std::fs::read_to_string(&path)?)
    }

    fn validate(&self) -> Result<()> {
        if self.channel_mult.is_empty() || self.vae.ch_mult.is_empty() {
            return Err(Error::UnrecognizedArchitecture(
                "empty channel multiplier list".to_string(),
            ));
        }
        if self.num_heads.is_none() && self.num_head_channels.is_none() {
            return Err(Error::UnrecognizedArchitecture(
                "neither num_heads nor num_head_channels is set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn levels(&self) -> usize {
        self.channel_mult.len()
    }

    pub fn level_channels(&self, level: usize) -> usize {
        self.model_channels * self.channel_mult[level]
    }

    /// Whether the blocks at `level` carry attention. Levels are counted from the
    /// full-resolution one, downsampling by two at each step.
    pub fn has_attention(&self, level: usize) -> bool {
        self.attention_resolutions.contains(&(1 << level))
    }

    pub fn heads(&self, channels: usize) -> usize {
        match (self.num_head_channels, self.num_heads) {
            (Some(per_head), _) => channels / per_head,
            (None, Some(heads)) => heads,
            (None, None) => 1,
        }
    }

    /// Channels of one attention head for a block with `channels` channels.
    pub fn head_channels(&self, channels: usize) -> usize {
        channels / self.heads(channels).max(1)
    }

    pub fn time_embed_dim(&self) -> usize {
        self.model_channels * 4
    }
}

fn positive(value: Option<i64>) -> Option<usize> {
    value.filter(|v| *v > 0).map(|v| v as usize)
}

#[derive(Deserialize)]
struct LdmDocument {
    model: LdmModel,
}

#[derive(Deserialize)]
struct LdmModel {
    params: LdmParams,
}

#[derive(Deserialize)]
struct LdmParams {
    #[serde(default = "default_linear_start")]
    linear_start: f64,
    #[serde(default = "default_linear_end")]
    linear_end: f64,
    #[serde(default = "default_timesteps")]
    timesteps: usize,
    #[serde(default = "default_scale_factor")]
    scale_factor: f64,
    unet_config: Nested<UnetParams>,
    first_stage_config: Nested<FirstStageParams>,
    #[serde(default)]
    cond_stage_config: Option<CondStage>,
}

#[derive(Deserialize)]
struct Nested<T> {
    params: T,
}

#[derive(Deserialize)]
struct CondStage {
    #[serde(default)]
    params: CondStageParams,
}

#[derive(Deserialize)]
struct CondStageParams {
    #[serde(default = "default_text_layers")]
    num_layers: usize,
}

impl Default for CondStageParams {
    fn default() -> Self {
        Self {
            num_layers: default_text_layers(),
        }
    }
}

#[derive(Deserialize)]
struct UnetParams {
    in_channels: usize,
    out_channels: usize,
    model_channels: usize,
    attention_resolutions: Vec<usize>,
    num_res_blocks: usize,
    channel_mult: Vec<usize>,
    #[serde(default)]
    num_heads: Option<i64>,
    #[serde(default)]
    num_head_channels: Option<i64>,
    #[serde(default = "default_depth")]
    transformer_depth: usize,
    context_dim: usize,
}

#[derive(Deserialize)]
struct FirstStageParams {
    ddconfig: DdConfig,
}

#[derive(Deserialize)]
struct DdConfig {
    z_channels: usize,
    ch: usize,
    ch_mult: Vec<usize>,
    num_res_blocks: usize,
}

fn default_linear_start() -> f64 {
    0.00085
}

fn default_linear_end() -> f64 {
    0.012
}

fn default_timesteps() -> usize {
    1000
}

fn default_scale_factor() -> f64 {
    0.18215
}

fn default_depth() -> usize {
    1
}

fn default_text_layers() -> usize {
    12
}
