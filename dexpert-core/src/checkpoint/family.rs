use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use super::{ArchConfig, WeightMap};
use crate::{Error, Result};

pub const STEM_KEY: &str = "model.diffusion_model.input_blocks.0.0.weight";
const CROSS_ATTN_KEY: &str =
    "model.diffusion_model.input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Sd1,
}

/// Metadata derived once per checkpoint. Every sub-model converted from the same
/// checkpoint is built from this descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyDescriptor {
    pub family: Family,
    pub inpaint: bool,
    pub arch: Arc<ArchConfig>,
}

impl FamilyDescriptor {
    pub fn sd1(inpaint: bool) -> Self {
        Self {
            family: Family::Sd1,
            inpaint,
            arch: Arc::new(ArchConfig::sd1(inpaint)),
        }
    }
}

/// Reads the stem convolution's input channels: 9 is the inpainting variant,
/// 4 the standard one.
pub fn detect_inpaint(tensors: &WeightMap) -> Result<bool> {
    let stem = tensors.get(STEM_KEY).ok_or_else(|| {
        Error::UnrecognizedArchitecture(format!("missing stem convolution {STEM_KEY}"))
    })?;
    let dims = stem.dims();
    if dims.len() != 4 {
        return Err(Error::UnrecognizedArchitecture(format!(
            "stem convolution has shape {dims:?}"
        )));
    }
    match dims[1] {
        9 => Ok(true),
        4 => Ok(false),
        other => Err(Error::UnrecognizedArchitecture(format!(
            "stem convolution takes {other} input channels"
        ))),
    }
}

/// Detects family and inpaint flag, then loads the matching architecture config
/// from `config_dir` (or the built-in preset).
pub fn detect(tensors: &WeightMap, config_dir: &Path) -> Result<FamilyDescriptor> {
    let inpaint = detect_inpaint(tensors)?;
    let family = Family::Sd1;
    let arch = ArchConfig::sd1_from_dir(config_dir, inpaint)?;
    if let Some(to_k) = tensors.get(CROSS_ATTN_KEY) {
        let context = to_k.dims().get(1).copied().unwrap_or_default();
        if context != arch.context_dim {
            return Err(Error::UnrecognizedArchitecture(format!(
                "cross attention context width {context} is not supported"
            )));
        }
    }
    if arch.in_channels != if inpaint { 9 } else { 4 } {
        return Err(Error::UnrecognizedArchitecture(format!(
            "config declares {} input channels for an {} checkpoint",
            arch.in_channels,
            if inpaint { "inpainting" } else { "standard" }
        )));
    }
    tracing::debug!(?family, inpaint, "detected checkpoint family");
    Ok(FamilyDescriptor {
        family,
        inpaint,
        arch: Arc::new(arch),
    })
}
