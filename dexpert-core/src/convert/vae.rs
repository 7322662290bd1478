//! LDM autoencoder layout (`first_stage_model.` prefix optional) to the diffusers layout.

use super::drop_trailing_singletons;
use crate::checkpoint::{VaeArch, WeightMap};
use crate::{Error, Result};

pub const PREFIX: &str = "first_stage_model.";
const COMPONENT: &str = "autoencoder";

/// Files already in diffusers layout pass through conversion unchanged.
pub fn is_diffusers_layout(tensors: &WeightMap) -> bool {
    tensors.keys().any(|k| k.starts_with("encoder.down_blocks."))
}

fn rename_resnet_param(rest: &str) -> String {
    match rest.strip_prefix("nin_shortcut.") {
        Some(param) => format!("conv_shortcut.{param}"),
        None => rest.to_string(),
    }
}

fn rename_mid(rest: &str) -> Option<(String, bool)> {
    if let Some(rest) = rest.strip_prefix("block_1.") {
        return Some((format!("mid_block.resnets.0.{}", rename_resnet_param(rest)), false));
    }
    if let Some(rest) = rest.strip_prefix("block_2.") {
        return Some((format!("mid_block.resnets.1.{}", rename_resnet_param(rest)), false));
    }
    let rest = rest.strip_prefix("attn_1.")?;
    let (layer, param) = rest.split_once('.')?;
    let layer = match layer {
        "norm" => "group_norm",
        "q" => "query",
        "k" => "key",
        "v" => "value",
        "proj_out" => "proj_attn",
        _ => return None,
    };
    let squeeze = layer != "group_norm" && param == "weight";
    Some((format!("mid_block.attentions.0.{layer}.{param}"), squeeze))
}

fn parse_level(rest: &str) -> Option<(usize, &str)> {
    let (index, rest) = rest.split_once('.')?;
    Some((index.parse().ok()?, rest))
}

/// Target name for one key relative to `encoder.`/`decoder.`, plus whether a
/// 1x1 convolution weight has to become a linear weight.
fn rename_coder(side: &str, key: &str, levels: usize) -> Option<(String, bool)> {
    match key.split_once('.')? {
        ("conv_in" | "conv_out", _) => Some((format!("{side}.{key}"), false)),
        ("norm_out", param) => Some((format!("{side}.conv_norm_out.{param}"), false)),
        ("mid", rest) => rename_mid(rest).map(|(k, squeeze)| (format!("{side}.{k}"), squeeze)),
        ("down", rest) if side == "encoder" => {
            let (level, rest) = parse_level(rest)?;
            if let Some(rest) = rest.strip_prefix("block.") {
                let (j, rest) = parse_level(rest)?;
                let param = rename_resnet_param(rest);
                Some((format!("encoder.down_blocks.{level}.resnets.{j}.{param}"), false))
            } else {
                let param = rest.strip_prefix("downsample.conv.")?;
                Some((format!("encoder.down_blocks.{level}.downsamplers.0.conv.{param}"), false))
            }
        }
        ("up", rest) if side == "decoder" => {
            let (level, rest) = parse_level(rest)?;
            let block = levels.checked_sub(level + 1)?;
            if let Some(rest) = rest.strip_prefix("block.") {
                let (j, rest) = parse_level(rest)?;
                let param = rename_resnet_param(rest);
                Some((format!("decoder.up_blocks.{block}.resnets.{j}.{param}"), false))
            } else {
                let param = rest.strip_prefix("upsample.conv.")?;
                Some((format!("decoder.up_blocks.{block}.upsamplers.0.conv.{param}"), false))
            }
        }
        _ => None,
    }
}

pub fn convert(tensors: &WeightMap, vae: &VaeArch) -> Result<WeightMap> {
    if is_diffusers_layout(tensors) {
        return Ok(tensors.clone());
    }
    let prefixed = tensors.keys().any(|k| k.starts_with(PREFIX));
    let levels = vae.ch_mult.len();
    let mut out = WeightMap::new();
    for (key, tensor) in tensors {
        let key = if prefixed {
            match key.strip_prefix(PREFIX) {
                Some(key) => key,
                None => continue,
            }
        } else {
            key.as_str()
        };
        let renamed = match key.split_once('.') {
            Some(("quant_conv" | "post_quant_conv", _)) => Some((key.to_string(), false)),
            Some((side @ ("encoder" | "decoder"), rest)) => rename_coder(side, rest, levels),
            // Training leftovers such as discriminator loss weights.
            _ => continue,
        };
        let (renamed, squeeze) =
            renamed.ok_or_else(|| Error::conversion(COMPONENT, format!("unexpected key {key}")))?;
        let tensor = if squeeze {
            drop_trailing_singletons(tensor)?
        } else {
            tensor.clone()
        };
        out.insert(renamed, tensor);
    }
    tracing::debug!(tensors = out.len(), "converted autoencoder");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::fixture;

    #[test]
    fn decoder_levels_are_reversed() {
        let arch = fixture::tiny_arch(false);
        let converted = convert(&fixture::ldm_vae(&arch.vae), &arch.vae).unwrap();
        // `up.1` is the lowest resolution level and becomes the first up block.
        assert!(converted.contains_key("decoder.up_blocks.0.upsamplers.0.conv.weight"));
        assert!(!converted.contains_key("decoder.up_blocks.1.upsamplers.0.conv.weight"));
        assert!(converted.contains_key("decoder.up_blocks.1.resnets.0.conv_shortcut.weight"));
        assert_eq!(converted["encoder.mid_block.attentions.0.query.weight"].rank(), 2);
        assert_eq!(converted["decoder.mid_block.attentions.0.group_norm.weight"].rank(), 1);
    }

    #[test]
    fn diffusers_files_pass_through() {
        let arch = fixture::tiny_arch(false);
        let converted = convert(&fixture::ldm_vae(&arch.vae), &arch.vae).unwrap();
        let again = convert(&converted, &arch.vae).unwrap();
        assert_eq!(again.len(), converted.len());
    }
}
