//! LDM `model.diffusion_model.*` layout to the diffusers UNet layout.

use std::collections::BTreeMap;

use candle_core::Tensor;

use super::{drop_trailing_singletons, split_fused_qkv};
use crate::checkpoint::{ArchConfig, WeightMap};
use crate::{Error, Result};

pub const PREFIX: &str = "model.diffusion_model.";
const COMPONENT: &str = "backbone";

const RESNET_RENAMES: [(&str, &str); 6] = [
    ("in_layers.0", "norm1"),
    ("in_layers.2", "conv1"),
    ("out_layers.0", "norm2"),
    ("out_layers.3", "conv2"),
    ("emb_layers.1", "time_emb_proj"),
    ("skip_connection", "conv_shortcut"),
];

/// Keys of one `<group>.<index>.<sub>` entry, with the group prefix stripped.
type Group<'a> = BTreeMap<&'a str, &'a Tensor>;

#[derive(Default)]
struct Partitioned<'a> {
    direct: Vec<(&'a str, &'a Tensor)>,
    input: BTreeMap<(usize, usize), Group<'a>>,
    middle: BTreeMap<usize, Group<'a>>,
    output: BTreeMap<(usize, usize), Group<'a>>,
}

fn split_index(key: &str) -> Option<(usize, &str)> {
    let (index, rest) = key.split_once('.')?;
    Some((index.parse().ok()?, rest))
}

fn partition(tensors: &WeightMap) -> Result<Partitioned<'_>> {
    let mut parts = Partitioned::default();
    for (key, tensor) in tensors {
        let Some(key) = key.strip_prefix(PREFIX) else {
            continue;
        };
        let malformed = || Error::conversion(COMPONENT, format!("malformed key {key}"));
        if let Some(rest) = key.strip_prefix("input_blocks.") {
            let (block, rest) = split_index(rest).ok_or_else(malformed)?;
            let (sub, rest) = split_index(rest).ok_or_else(malformed)?;
            if block == 0 {
                parts.direct.push((key, tensor));
            } else {
                parts.input.entry((block, sub)).or_default().insert(rest, tensor);
            }
        } else if let Some(rest) = key.strip_prefix("middle_block.") {
            let (sub, rest) = split_index(rest).ok_or_else(malformed)?;
            parts.middle.entry(sub).or_default().insert(rest, tensor);
        } else if let Some(rest) = key.strip_prefix("output_blocks.") {
            let (block, rest) = split_index(rest).ok_or_else(malformed)?;
            let (sub, rest) = split_index(rest).ok_or_else(malformed)?;
            parts.output.entry((block, sub)).or_default().insert(rest, tensor);
        } else {
            parts.direct.push((key, tensor));
        }
    }
    Ok(parts)
}

fn rename_direct(key: &str) -> Option<String> {
    const TABLE: [(&str, &str); 5] = [
        ("time_embed.0.", "time_embedding.linear_1."),
        ("time_embed.2.", "time_embedding.linear_2."),
        ("input_blocks.0.0.", "conv_in."),
        ("out.0.", "conv_norm_out."),
        ("out.2.", "conv_out."),
    ];
    TABLE
        .iter()
        .find_map(|(old, new)| key.strip_prefix(old).map(|rest| format!("{new}{rest}")))
}

fn convert_resnet(group: &Group<'_>, target: &str, out: &mut WeightMap) -> Result<()> {
    for (key, tensor) in group {
        let renamed = RESNET_RENAMES
            .iter()
            .find_map(|(old, new)| {
                key.strip_prefix(old)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|rest| format!("{target}.{new}.{rest}"))
            })
            .ok_or_else(|| Error::conversion(COMPONENT, format!("unknown resnet key {key}")))?;
        out.insert(renamed, (*tensor).clone());
    }
    Ok(())
}

/// Spatial transformers share the diffusers naming; legacy attention blocks store a
/// fused `qkv` projection that is split per head.
fn convert_attention(
    group: &Group<'_>,
    target: &str,
    head_channels: usize,
    out: &mut WeightMap,
) -> Result<()> {
    let legacy = group.keys().any(|k| k.starts_with("qkv."));
    for (key, tensor) in group {
        if !legacy {
            out.insert(format!("{target}.{key}"), (*tensor).clone());
            continue;
        }
        let (layer, param) = key
            .split_once('.')
            .ok_or_else(|| Error::conversion(COMPONENT, format!("malformed attention key {key}")))?;
        match layer {
            "qkv" => {
                let [q, k, v] = split_fused_qkv(tensor, head_channels)?;
                out.insert(format!("{target}.query.{param}"), q);
                out.insert(format!("{target}.key.{param}"), k);
                out.insert(format!("{target}.value.{param}"), v);
            }
            "proj_out" => {
                let tensor = if param == "weight" {
                    drop_trailing_singletons(tensor)?
                } else {
                    (*tensor).clone()
                };
                out.insert(format!("{target}.proj_attn.{param}"), tensor);
            }
            "norm" => {
                out.insert(format!("{target}.group_norm.{param}"), (*tensor).clone());
            }
            other => {
                return Err(Error::conversion(
                    COMPONENT,
                    format!("unknown attention layer {other}"),
                ))
            }
        }
    }
    Ok(())
}

fn is_resampler(group: &Group<'_>, conv: &str) -> bool {
    group.len() == 2
        && group.contains_key(format!("{conv}.weight").as_str())
        && group.contains_key(format!("{conv}.bias").as_str())
}

fn copy_resampler(group: &Group<'_>, conv: &str, target: &str, out: &mut WeightMap) {
    for param in ["weight", "bias"] {
        if let Some(tensor) = group.get(format!("{conv}.{param}").as_str()) {
            out.insert(format!("{target}.{param}"), (*tensor).clone());
        }
    }
}

/// Renames and reshapes the backbone. The result is not yet checked against the
/// expected parameter names.
pub fn convert(tensors: &WeightMap, arch: &ArchConfig) -> Result<WeightMap> {
    let parts = partition(tensors)?;
    let per_block = arch.num_res_blocks + 1;
    let mut out = WeightMap::new();

    for (key, tensor) in parts.direct {
        let renamed = rename_direct(key)
            .ok_or_else(|| Error::conversion(COMPONENT, format!("unexpected key {key}")))?;
        out.insert(renamed, tensor.clone());
    }

    for ((index, sub), group) in &parts.input {
        let block = (index - 1) / per_block;
        let layer = (index - 1) % per_block;
        let level_channels = arch.level_channels(block.min(arch.levels() - 1));
        if layer == arch.num_res_blocks && is_resampler(group, "op") {
            let target = format!("down_blocks.{block}.downsamplers.0.conv");
            copy_resampler(group, "op", &target, &mut out);
        } else if *sub == 0 {
            convert_resnet(group, &format!("down_blocks.{block}.resnets.{layer}"), &mut out)?;
        } else {
            let target = format!("down_blocks.{block}.attentions.{layer}");
            convert_attention(group, &target, arch.head_channels(level_channels), &mut out)?;
        }
    }

    let mid_channels = arch.level_channels(arch.levels() - 1);
    for (sub, group) in &parts.middle {
        match sub {
            0 => convert_resnet(group, "mid_block.resnets.0", &mut out)?,
            1 => convert_attention(
                group,
                "mid_block.attentions.0",
                arch.head_channels(mid_channels),
                &mut out,
            )?,
            2 => convert_resnet(group, "mid_block.resnets.1", &mut out)?,
            other => {
                return Err(Error::conversion(
                    COMPONENT,
                    format!("unexpected middle block index {other}"),
                ))
            }
        }
    }

    for ((index, sub), group) in &parts.output {
        let block = index / per_block;
        let layer = index % per_block;
        let level = arch.levels().saturating_sub(block + 1);
        if *sub == 0 {
            convert_resnet(group, &format!("up_blocks.{block}.resnets.{layer}"), &mut out)?;
        } else if is_resampler(group, "conv") {
            let target = format!("up_blocks.{block}.upsamplers.0.conv");
            copy_resampler(group, "conv", &target, &mut out);
        } else {
            let head_channels = arch.head_channels(arch.level_channels(level));
            let target = format!("up_blocks.{block}.attentions.{layer}");
            convert_attention(group, &target, head_channels, &mut out)?;
        }
    }

    tracing::debug!(tensors = out.len(), "converted backbone");
    Ok(out)
}
