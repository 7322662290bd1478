//! Pure transformation from LDM checkpoint layout to the layouts the candle
//! sub-models expect. Every converted map is checked against the exact parameter
//! names of its target architecture.

mod clip;
pub mod expected;
#[cfg(test)]
pub(crate) mod fixture;
mod unet;
mod vae;

use std::path::Path;

use candle_core::{DType, Tensor};

use crate::checkpoint::{self, Checkpoint, FamilyDescriptor, WeightMap};
use crate::{Error, Result};

pub use expected::NameSet;
pub use vae::is_diffusers_layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubModel {
    Backbone,
    Autoencoder,
    TextEncoder,
}

impl SubModel {
    fn component(self) -> &'static str {
        match self {
            SubModel::Backbone => "backbone",
            SubModel::Autoencoder => "autoencoder",
            SubModel::TextEncoder => "text encoder",
        }
    }

    pub fn expected_names(self, descriptor: &FamilyDescriptor) -> NameSet {
        match self {
            SubModel::Backbone => expected::unet_names(&descriptor.arch),
            SubModel::Autoencoder => expected::vae_names(&descriptor.arch.vae),
            SubModel::TextEncoder => expected::clip_names(descriptor.arch.text_layers),
        }
    }
}

/// Converts one sub-model out of `tensors`.
pub fn convert(
    tensors: &WeightMap,
    descriptor: &FamilyDescriptor,
    sub_model: SubModel,
) -> Result<WeightMap> {
    let converted = match sub_model {
        SubModel::Backbone => unet::convert(tensors, &descriptor.arch)?,
        SubModel::Autoencoder => vae::convert(tensors, &descriptor.arch.vae)?,
        SubModel::TextEncoder => clip::convert(tensors),
    };
    validate(sub_model.component(), &converted, &sub_model.expected_names(descriptor))?;
    Ok(converted)
}

/// Backbone and text encoder state derived from one checkpoint.
#[derive(Debug, Clone)]
pub struct ConvertedCheckpoint {
    pub descriptor: FamilyDescriptor,
    pub backbone: WeightMap,
    pub text_encoder: WeightMap,
}

/// Detects the family of `checkpoint` and converts its backbone and text encoder,
/// casting every tensor to `dtype`.
pub fn convert_checkpoint(
    checkpoint: &Checkpoint,
    config_dir: &Path,
    dtype: DType,
) -> Result<ConvertedCheckpoint> {
    let descriptor = checkpoint::detect(checkpoint.tensors(), config_dir)?;
    let backbone = convert(checkpoint.tensors(), &descriptor, SubModel::Backbone)?;
    let text_encoder = convert(checkpoint.tensors(), &descriptor, SubModel::TextEncoder)?;
    Ok(ConvertedCheckpoint {
        descriptor,
        backbone: cast(backbone, dtype)?,
        text_encoder: cast(text_encoder, dtype)?,
    })
}

pub fn cast(tensors: WeightMap, dtype: DType) -> Result<WeightMap> {
    tensors
        .into_iter()
        .map(|(key, tensor)| Ok((key, tensor.to_dtype(dtype)?)))
        .collect()
}

fn preview(names: &[&String]) -> String {
    const SHOWN: usize = 5;
    let mut listed: Vec<&str> = names.iter().take(SHOWN).map(|s| s.as_str()).collect();
    if names.len() > SHOWN {
        listed.push("...");
    }
    listed.join(", ")
}

/// The converted key set must equal `expected`; anything else would leave the
/// model partially initialized.
pub fn validate(component: &'static str, converted: &WeightMap, expected: &NameSet) -> Result<()> {
    let mut missing: Vec<&String> = expected.iter().filter(|k| !converted.contains_key(*k)).collect();
    let mut extra: Vec<&String> = converted.keys().filter(|k| !expected.contains(*k)).collect();
    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    missing.sort();
    extra.sort();
    Err(Error::conversion(
        component,
        format!(
            "{} missing [{}], {} unexpected [{}]",
            missing.len(),
            preview(&missing),
            extra.len(),
            preview(&extra)
        ),
    ))
}

/// Splits a fused `qkv` projection of shape `[3C, ...]`, stored head by head,
/// into query, key and value of shape `[C, ...]`.
pub(crate) fn split_fused_qkv(tensor: &Tensor, head_channels: usize) -> Result<[Tensor; 3]> {
    let dims = tensor.dims().to_vec();
    let fused = dims.first().copied().unwrap_or_default();
    if fused == 0 || fused % 3 != 0 || head_channels == 0 || (fused / 3) % head_channels != 0 {
        return Err(Error::conversion(
            "attention",
            format!("cannot split qkv of shape {dims:?} into heads of {head_channels}"),
        ));
    }
    let channels = fused / 3;
    let heads = channels / head_channels;
    let rest: usize = dims[1..].iter().product();
    let per_head = tensor.reshape((heads, 3 * head_channels, rest))?;
    let part = |index: usize| -> Result<Tensor> {
        let part = per_head
            .narrow(1, index * head_channels, head_channels)?
            .contiguous()?;
        Ok(if dims.len() == 1 {
            part.reshape(channels)?
        } else {
            part.reshape((channels, rest))?
        })
    };
    Ok([part(0)?, part(1)?, part(2)?])
}

/// Turns a 1x1 convolution weight into a linear weight.
pub(crate) fn drop_trailing_singletons(tensor: &Tensor) -> Result<Tensor> {
    let mut dims = tensor.dims().to_vec();
    while dims.len() > 2 && dims.last() == Some(&1) {
        dims.pop();
    }
    Ok(tensor.reshape(dims)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarBuilder;
    use candle_transformers::models::stable_diffusion::{unet_2d, vae};

    use crate::checkpoint::STEM_KEY;
    use crate::sd::{unet_config, vae_config};

    fn descriptor() -> FamilyDescriptor {
        fixture::tiny_descriptor(false)
    }

    fn shapes(map: &WeightMap) -> Vec<(String, Vec<usize>)> {
        let mut shapes: Vec<_> = map.iter().map(|(k, t)| (k.clone(), t.dims().to_vec())).collect();
        shapes.sort();
        shapes
    }

    #[test]
    fn conversion_is_deterministic() {
        let descriptor = descriptor();
        let tensors = fixture::ldm_checkpoint(&descriptor.arch);
        let first = convert(&tensors, &descriptor, SubModel::Backbone).unwrap();
        let second = convert(&tensors, &descriptor, SubModel::Backbone).unwrap();
        assert_eq!(shapes(&first), shapes(&second));
    }

    #[test]
    fn missing_key_is_fatal() {
        let descriptor = descriptor();
        let mut tensors = fixture::ldm_checkpoint(&descriptor.arch);
        tensors.remove("model.diffusion_model.middle_block.2.out_layers.3.bias");
        let err = convert(&tensors, &descriptor, SubModel::Backbone).unwrap_err();
        match err {
            Error::Conversion { reason, .. } => {
                assert!(reason.contains("mid_block.resnets.1.conv2.bias"), "{reason}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn extra_key_is_fatal() {
        let descriptor = descriptor();
        let mut tensors = fixture::ldm_checkpoint(&descriptor.arch);
        let extra = tensors[STEM_KEY].clone();
        tensors.insert("model.diffusion_model.output_blocks.9.0.in_layers.0.weight".into(), extra);
        let err = convert(&tensors, &descriptor, SubModel::Backbone).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }

    #[test]
    fn converted_backbone_instantiates() -> Result<()> {
        let descriptor = descriptor();
        let tensors = fixture::ldm_checkpoint(&descriptor.arch);
        let weights = convert(&tensors, &descriptor, SubModel::Backbone)?;
        let dev = Device::Cpu;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &dev);
        let arch = &descriptor.arch;
        let unet = unet_2d::UNet2DConditionModel::new(
            vb,
            arch.in_channels,
            arch.out_channels,
            false,
            unet_config(arch),
        )?;
        let latents = Tensor::zeros((1, 4, 8, 8), DType::F32, &dev)?;
        let context = Tensor::zeros((1, 3, arch.context_dim), DType::F32, &dev)?;
        let out = unet.forward(&latents, 10., &context)?;
        assert_eq!(out.dims(), &[1, 4, 8, 8]);
        Ok(())
    }

    #[test]
    fn converted_autoencoder_instantiates() -> Result<()> {
        let descriptor = descriptor();
        let tensors = fixture::ldm_checkpoint(&descriptor.arch);
        let weights = convert(&tensors, &descriptor, SubModel::Autoencoder)?;
        let dev = Device::Cpu;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &dev);
        let model = vae::AutoEncoderKL::new(vb, 3, 3, vae_config(&descriptor.arch.vae))?;
        let latents = Tensor::zeros((1, 4, 4, 4), DType::F32, &dev)?;
        let image = model.decode(&latents)?;
        assert_eq!(image.dims(), &[1, 3, 8, 8]);
        Ok(())
    }

    #[test]
    fn converted_text_encoder_matches_names() {
        let descriptor = descriptor();
        let tensors = fixture::ldm_checkpoint(&descriptor.arch);
        let weights = convert(&tensors, &descriptor, SubModel::TextEncoder).unwrap();
        assert_eq!(weights.len(), expected::clip_names(descriptor.arch.text_layers).len());
    }

    #[test]
    fn checkpoint_conversion_casts() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = descriptor();
        let checkpoint = Checkpoint::new("tiny.safetensors", fixture::ldm_checkpoint(&descriptor.arch));
        std::fs::write(
            dir.path().join("v1-inference.yaml"),
            fixture::tiny_yaml(false),
        )
        .unwrap();
        let converted = convert_checkpoint(&checkpoint, dir.path(), DType::F16).unwrap();
        assert_eq!(converted.descriptor, descriptor);
        assert!(converted.backbone.values().all(|t| t.dtype() == DType::F16));
    }
}
