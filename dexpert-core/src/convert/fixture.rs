//! Miniature LDM-layout checkpoints with correct shapes, small enough to
//! instantiate the candle models in tests.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::checkpoint::{ArchConfig, Family, FamilyDescriptor, VaeArch, WeightMap};

pub fn tiny_arch(inpaint: bool) -> ArchConfig {
    ArchConfig {
        in_channels: if inpaint { 9 } else { 4 },
        out_channels: 4,
        model_channels: 32,
        channel_mult: vec![1, 2],
        attention_resolutions: vec![1],
        num_res_blocks: 1,
        num_heads: Some(2),
        num_head_channels: None,
        transformer_depth: 1,
        context_dim: 16,
        linear_start: 0.00085,
        linear_end: 0.012,
        timesteps: 1000,
        scale_factor: 0.18215,
        text_layers: 1,
        vae: VaeArch {
            ch: 32,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            z_channels: 4,
        },
    }
}

pub fn tiny_descriptor(inpaint: bool) -> FamilyDescriptor {
    FamilyDescriptor {
        family: Family::Sd1,
        inpaint,
        arch: Arc::new(tiny_arch(inpaint)),
    }
}

pub fn tiny_yaml(inpaint: bool) -> String {
    format!(
        r#"
model:
  params:
    linear_start: 0.00085
    linear_end: 0.012
    timesteps: 1000
    scale_factor: 0.18215
    unet_config:
      params:
        in_channels: {}
        out_channels: 4
        model_channels: 32
        attention_resolutions: [1]
        num_res_blocks: 1
        channel_mult: [1, 2]
        num_heads: 2
        transformer_depth: 1
        context_dim: 16
    first_stage_config:
      params:
        ddconfig:
          z_channels: 4
          ch: 32
          ch_mult: [1, 2]
          num_res_blocks: 1
    cond_stage_config:
      params:
        num_layers: 1
"#,
        if inpaint { 9 } else { 4 }
    )
}

struct Builder {
    prefix: String,
    map: WeightMap,
}

impl Builder {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            map: WeightMap::new(),
        }
    }

    fn put(&mut self, key: &str, shape: &[usize]) {
        let tensor = Tensor::zeros(shape, DType::F32, &Device::Cpu).expect("zeros");
        self.map.insert(format!("{}{key}", self.prefix), tensor);
    }

    fn wb(&mut self, key: &str, weight: &[usize]) {
        self.put(&format!("{key}.weight"), weight);
        self.put(&format!("{key}.bias"), &weight[..1]);
    }

    fn norm(&mut self, key: &str, channels: usize) {
        self.wb(key, &[channels]);
    }

    fn conv(&mut self, key: &str, out: usize, inp: usize, k: usize) {
        self.wb(key, &[out, inp, k, k]);
    }

    fn unet_resnet(&mut self, key: &str, inp: usize, out: usize, temb: usize) {
        self.norm(&format!("{key}.in_layers.0"), inp);
        self.conv(&format!("{key}.in_layers.2"), out, inp, 3);
        self.wb(&format!("{key}.emb_layers.1"), &[out, temb]);
        self.norm(&format!("{key}.out_layers.0"), out);
        self.conv(&format!("{key}.out_layers.3"), out, out, 3);
        if inp != out {
            self.conv(&format!("{key}.skip_connection"), out, inp, 1);
        }
    }

    fn spatial(&mut self, key: &str, c: usize, context: usize) {
        self.norm(&format!("{key}.norm"), c);
        self.conv(&format!("{key}.proj_in"), c, c, 1);
        let block = format!("{key}.transformer_blocks.0");
        for (attn, kv) in [("attn1", c), ("attn2", context)] {
            self.put(&format!("{block}.{attn}.to_q.weight"), &[c, c]);
            self.put(&format!("{block}.{attn}.to_k.weight"), &[c, kv]);
            self.put(&format!("{block}.{attn}.to_v.weight"), &[c, kv]);
            self.wb(&format!("{block}.{attn}.to_out.0"), &[c, c]);
        }
        for norm in ["norm1", "norm2", "norm3"] {
            self.norm(&format!("{block}.{norm}"), c);
        }
        self.wb(&format!("{block}.ff.net.0.proj"), &[8 * c, c]);
        self.wb(&format!("{block}.ff.net.2"), &[c, 4 * c]);
        self.conv(&format!("{key}.proj_out"), c, c, 1);
    }

    fn vae_resnet(&mut self, key: &str, inp: usize, out: usize) {
        self.norm(&format!("{key}.norm1"), inp);
        self.conv(&format!("{key}.conv1"), out, inp, 3);
        self.norm(&format!("{key}.norm2"), out);
        self.conv(&format!("{key}.conv2"), out, out, 3);
        if inp != out {
            self.conv(&format!("{key}.nin_shortcut"), out, inp, 1);
        }
    }

    fn vae_mid(&mut self, key: &str, c: usize) {
        self.vae_resnet(&format!("{key}.block_1"), c, c);
        self.norm(&format!("{key}.attn_1.norm"), c);
        for proj in ["q", "k", "v", "proj_out"] {
            self.conv(&format!("{key}.attn_1.{proj}"), c, c, 1);
        }
        self.vae_resnet(&format!("{key}.block_2"), c, c);
    }
}

pub fn ldm_unet(arch: &ArchConfig) -> WeightMap {
    let mut b = Builder::new("model.diffusion_model.");
    let c0 = arch.model_channels;
    let temb = arch.time_embed_dim();
    let per_block = arch.num_res_blocks + 1;
    b.wb("time_embed.0", &[temb, c0]);
    b.wb("time_embed.2", &[temb, temb]);
    b.conv("input_blocks.0.0", c0, arch.in_channels, 3);

    let mut skips = vec![c0];
    let mut prev = c0;
    for level in 0..arch.levels() {
        let out = arch.level_channels(level);
        for j in 0..arch.num_res_blocks {
            let index = 1 + level * per_block + j;
            b.unet_resnet(&format!("input_blocks.{index}.0"), prev, out, temb);
            if arch.has_attention(level) {
                b.spatial(&format!("input_blocks.{index}.1"), out, arch.context_dim);
            }
            skips.push(out);
            prev = out;
        }
        if level + 1 < arch.levels() {
            let index = 1 + level * per_block + arch.num_res_blocks;
            b.conv(&format!("input_blocks.{index}.0.op"), out, out, 3);
            skips.push(out);
        }
    }

    b.unet_resnet("middle_block.0", prev, prev, temb);
    b.spatial("middle_block.1", prev, arch.context_dim);
    b.unet_resnet("middle_block.2", prev, prev, temb);

    for up in 0..arch.levels() {
        let level = arch.levels() - 1 - up;
        let out = arch.level_channels(level);
        for j in 0..per_block {
            let index = up * per_block + j;
            let skip = skips.pop().expect("skip channels");
            b.unet_resnet(&format!("output_blocks.{index}.0"), prev + skip, out, temb);
            let mut sub = 1;
            if arch.has_attention(level) {
                b.spatial(&format!("output_blocks.{index}.1"), out, arch.context_dim);
                sub = 2;
            }
            if j == arch.num_res_blocks && level > 0 {
                b.conv(&format!("output_blocks.{index}.{sub}.conv"), out, out, 3);
            }
            prev = out;
        }
    }

    b.norm("out.0", c0);
    b.conv("out.2", arch.out_channels, c0, 3);
    b.map
}

pub fn ldm_vae(vae: &VaeArch) -> WeightMap {
    let mut b = Builder::new("first_stage_model.");
    let levels = vae.ch_mult.len();
    let channels = |level: usize| vae.ch * vae.ch_mult[level];
    let mid = channels(levels - 1);
    let z = vae.z_channels;

    b.conv("encoder.conv_in", vae.ch, 3, 3);
    let mut prev = vae.ch;
    for level in 0..levels {
        let out = channels(level);
        for j in 0..vae.num_res_blocks {
            b.vae_resnet(&format!("encoder.down.{level}.block.{j}"), prev, out);
            prev = out;
        }
        if level + 1 < levels {
            b.conv(&format!("encoder.down.{level}.downsample.conv"), out, out, 3);
        }
    }
    b.vae_mid("encoder.mid", mid);
    b.norm("encoder.norm_out", mid);
    b.conv("encoder.conv_out", 2 * z, mid, 3);
    b.conv("quant_conv", 2 * z, 2 * z, 1);
    b.conv("post_quant_conv", z, z, 1);

    b.conv("decoder.conv_in", mid, z, 3);
    b.vae_mid("decoder.mid", mid);
    let mut prev = mid;
    for level in (0..levels).rev() {
        let out = channels(level);
        for j in 0..=vae.num_res_blocks {
            b.vae_resnet(&format!("decoder.up.{level}.block.{j}"), prev, out);
            prev = out;
        }
        if level != 0 {
            b.conv(&format!("decoder.up.{level}.upsample.conv"), out, out, 3);
        }
    }
    b.norm("decoder.norm_out", vae.ch);
    b.conv("decoder.conv_out", 3, vae.ch, 3);
    b.map
}

pub fn ldm_clip(layers: usize) -> WeightMap {
    let mut b = Builder::new("cond_stage_model.transformer.text_model.");
    let dim = 8;
    b.put("embeddings.token_embedding.weight", &[64, dim]);
    b.put("embeddings.position_embedding.weight", &[77, dim]);
    b.put("embeddings.position_ids", &[1, 77]);
    for i in 0..layers {
        let layer = format!("encoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            b.wb(&format!("{layer}.self_attn.{proj}"), &[dim, dim]);
        }
        b.norm(&format!("{layer}.layer_norm1"), dim);
        b.norm(&format!("{layer}.layer_norm2"), dim);
        b.wb(&format!("{layer}.mlp.fc1"), &[4 * dim, dim]);
        b.wb(&format!("{layer}.mlp.fc2"), &[dim, 4 * dim]);
    }
    b.norm("final_layer_norm", dim);
    b.map
}

/// A full checkpoint: backbone, autoencoder and text encoder under their LDM prefixes.
pub fn ldm_checkpoint(arch: &ArchConfig) -> WeightMap {
    let mut map = ldm_unet(arch);
    map.extend(ldm_vae(&arch.vae));
    map.extend(ldm_clip(arch.text_layers));
    map
}
