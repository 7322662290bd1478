//! Parameter names of the target (diffusers-layout) architectures, computed from
//! the architecture config. Converted maps must match these sets exactly.

use std::collections::BTreeSet;

use crate::checkpoint::{ArchConfig, VaeArch};

pub type NameSet = BTreeSet<String>;

fn weight_and_bias(names: &mut NameSet, prefix: &str) {
    names.insert(format!("{prefix}.weight"));
    names.insert(format!("{prefix}.bias"));
}

fn unet_resnet(names: &mut NameSet, prefix: &str, shortcut: bool) {
    for layer in ["norm1", "conv1", "time_emb_proj", "norm2", "conv2"] {
        weight_and_bias(names, &format!("{prefix}.{layer}"));
    }
    if shortcut {
        weight_and_bias(names, &format!("{prefix}.conv_shortcut"));
    }
}

fn spatial_transformer(names: &mut NameSet, prefix: &str, depth: usize) {
    for layer in ["norm", "proj_in", "proj_out"] {
        weight_and_bias(names, &format!("{prefix}.{layer}"));
    }
    for t in 0..depth {
        let block = format!("{prefix}.transformer_blocks.{t}");
        for attn in ["attn1", "attn2"] {
            for proj in ["to_q", "to_k", "to_v"] {
                names.insert(format!("{block}.{attn}.{proj}.weight"));
            }
            weight_and_bias(names, &format!("{block}.{attn}.to_out.0"));
        }
        for norm in ["norm1", "norm2", "norm3"] {
            weight_and_bias(names, &format!("{block}.{norm}"));
        }
        weight_and_bias(names, &format!("{block}.ff.net.0.proj"));
        weight_and_bias(names, &format!("{block}.ff.net.2"));
    }
}

pub fn unet_names(arch: &ArchConfig) -> NameSet {
    let mut names = NameSet::new();
    weight_and_bias(&mut names, "conv_in");
    weight_and_bias(&mut names, "time_embedding.linear_1");
    weight_and_bias(&mut names, "time_embedding.linear_2");

    let levels = arch.levels();
    let layers = arch.num_res_blocks;
    let depth = arch.transformer_depth;
    let mut prev = arch.model_channels;
    for b in 0..levels {
        let out = arch.level_channels(b);
        for j in 0..layers {
            let shortcut = j == 0 && prev != out;
            unet_resnet(&mut names, &format!("down_blocks.{b}.resnets.{j}"), shortcut);
            if arch.has_attention(b) {
                spatial_transformer(&mut names, &format!("down_blocks.{b}.attentions.{j}"), depth);
            }
        }
        if b + 1 < levels {
            weight_and_bias(&mut names, &format!("down_blocks.{b}.downsamplers.0.conv"));
        }
        prev = out;
    }

    unet_resnet(&mut names, "mid_block.resnets.0", false);
    spatial_transformer(&mut names, "mid_block.attentions.0", depth);
    unet_resnet(&mut names, "mid_block.resnets.1", false);

    for b in 0..levels {
        let level = levels - 1 - b;
        // Up resnets always concatenate a skip connection, so the channel count changes.
        for j in 0..=layers {
            unet_resnet(&mut names, &format!("up_blocks.{b}.resnets.{j}"), true);
            if arch.has_attention(level) {
                spatial_transformer(&mut names, &format!("up_blocks.{b}.attentions.{j}"), depth);
            }
        }
        if b + 1 < levels {
            weight_and_bias(&mut names, &format!("up_blocks.{b}.upsamplers.0.conv"));
        }
    }

    weight_and_bias(&mut names, "conv_norm_out");
    weight_and_bias(&mut names, "conv_out");
    names
}

fn vae_resnet(names: &mut NameSet, prefix: &str, shortcut: bool) {
    for layer in ["norm1", "conv1", "norm2", "conv2"] {
        weight_and_bias(names, &format!("{prefix}.{layer}"));
    }
    if shortcut {
        weight_and_bias(names, &format!("{prefix}.conv_shortcut"));
    }
}

fn vae_mid_block(names: &mut NameSet, prefix: &str) {
    vae_resnet(names, &format!("{prefix}.mid_block.resnets.0"), false);
    for layer in ["group_norm", "query", "key", "value", "proj_attn"] {
        weight_and_bias(names, &format!("{prefix}.mid_block.attentions.0.{layer}"));
    }
    vae_resnet(names, &format!("{prefix}.mid_block.resnets.1"), false);
}

pub fn vae_names(vae: &VaeArch) -> NameSet {
    let mut names = NameSet::new();
    let levels = vae.ch_mult.len();
    let channels = |level: usize| vae.ch * vae.ch_mult[level];

    weight_and_bias(&mut names, "encoder.conv_in");
    let mut prev = vae.ch;
    for i in 0..levels {
        let out = channels(i);
        for j in 0..vae.num_res_blocks {
            let shortcut = j == 0 && prev != out;
            vae_resnet(&mut names, &format!("encoder.down_blocks.{i}.resnets.{j}"), shortcut);
        }
        if i + 1 < levels {
            weight_and_bias(&mut names, &format!("encoder.down_blocks.{i}.downsamplers.0.conv"));
        }
        prev = out;
    }
    vae_mid_block(&mut names, "encoder");
    weight_and_bias(&mut names, "encoder.conv_norm_out");
    weight_and_bias(&mut names, "encoder.conv_out");

    weight_and_bias(&mut names, "quant_conv");
    weight_and_bias(&mut names, "post_quant_conv");

    weight_and_bias(&mut names, "decoder.conv_in");
    vae_mid_block(&mut names, "decoder");
    let mut prev = channels(levels - 1);
    for i in 0..levels {
        let out = channels(levels - 1 - i);
        for j in 0..=vae.num_res_blocks {
            let shortcut = j == 0 && prev != out;
            vae_resnet(&mut names, &format!("decoder.up_blocks.{i}.resnets.{j}"), shortcut);
        }
        if i + 1 < levels {
            weight_and_bias(&mut names, &format!("decoder.up_blocks.{i}.upsamplers.0.conv"));
        }
        prev = out;
    }
    weight_and_bias(&mut names, "decoder.conv_norm_out");
    weight_and_bias(&mut names, "decoder.conv_out");
    names
}

pub fn clip_names(layers: usize) -> NameSet {
    let mut names = NameSet::new();
    names.insert("text_model.embeddings.token_embedding.weight".to_string());
    names.insert("text_model.embeddings.position_embedding.weight".to_string());
    for i in 0..layers {
        let layer = format!("text_model.encoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            weight_and_bias(&mut names, &format!("{layer}.self_attn.{proj}"));
        }
        for norm in ["layer_norm1", "layer_norm2"] {
            weight_and_bias(&mut names, &format!("{layer}.{norm}"));
        }
        weight_and_bias(&mut names, &format!("{layer}.mlp.fc1"));
        weight_and_bias(&mut names, &format!("{layer}.mlp.fc2"));
    }
    weight_and_bias(&mut names, "text_model.final_layer_norm");
    names
}
