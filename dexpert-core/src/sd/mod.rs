//! Stable Diffusion sub-models on candle, and the factory the cache loads them with.

mod resident;
mod tiny_vae;
mod tokenizer;

use std::path::{Path, PathBuf};

use candle_core::{DType, Module, Tensor};
use candle_transformers::models::stable_diffusion::{clip, unet_2d, vae};
use hf_hub::api::sync::{Api, ApiBuilder};

pub use resident::ResidentModel;
pub use tiny_vae::{TinyDecoder, TinyLayout};
pub use tokenizer::{ClipTokenizer, CONTEXT_LENGTH};

use crate::checkpoint::{self, ArchConfig, Family, FamilyDescriptor, VaeArch, WeightMap};
use crate::convert::{self, expected, is_diffusers_layout, ConvertedCheckpoint, SubModel};
use crate::lora::LayerTable;
use crate::models::{Autoencoder, Denoiser, LatentDecoder, ModelFactory, Placement, TextEncoder};
use crate::settings::{DirKind, ModelDirectories};
use crate::{Error, Result};

const NORM_GROUPS: usize = 32;

pub fn unet_config(arch: &ArchConfig) -> unet_2d::UNet2DConditionModelConfig {
    let blocks = (0..arch.levels())
        .map(|level| {
            let channels = arch.level_channels(level);
            unet_2d::BlockConfig {
                out_channels: channels,
                use_cross_attn: arch.has_attention(level).then_some(arch.transformer_depth),
                attention_head_dim: arch.heads(channels),
            }
        })
        .collect();
    unet_2d::UNet2DConditionModelConfig {
        blocks,
        layers_per_block: arch.num_res_blocks,
        cross_attention_dim: arch.context_dim,
        norm_num_groups: NORM_GROUPS,
        use_linear_projection: false,
        ..Default::default()
    }
}

pub fn vae_config(arch: &VaeArch) -> vae::AutoEncoderKLConfig {
    vae::AutoEncoderKLConfig {
        block_out_channels: arch.ch_mult.iter().map(|mult| arch.ch * mult).collect(),
        layers_per_block: arch.num_res_blocks,
        latent_channels: arch.z_channels,
        norm_num_groups: NORM_GROUPS,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// Hub locations of the components a checkpoint does not carry.
struct HubSources {
    autoencoder: (&'static str, &'static str),
    fast_decoder: (&'static str, &'static str),
    tokenizer: (&'static str, &'static str),
}

fn hub_sources(family: Family) -> HubSources {
    match family {
        Family::Sd1 => HubSources {
            autoencoder: ("CompVis/stable-diffusion-v1-4", "vae/diffusion_pytorch_model.safetensors"),
            fast_decoder: ("madebyollin/taesd", "diffusion_pytorch_model.safetensors"),
            tokenizer: ("openai/clip-vit-large-patch14", "tokenizer.json"),
        },
    }
}

/// Local file names checked in the auxiliary directory before the hub.
fn local_names(family: Family) -> [&'static str; 3] {
    match family {
        Family::Sd1 => ["sd15.vae.safetensors", "taesd.safetensors", "tokenizer.json"],
    }
}

pub struct Unet {
    model: unet_2d::UNet2DConditionModel,
    in_channels: usize,
}

impl Denoiser for ResidentModel<Unet> {
    fn in_channels(&self) -> usize {
        self.model().in_channels
    }

    fn forward(&self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor> {
        let device = crate::models::Resident::device(self);
        let latents = latents.to_device(&device)?.to_dtype(self.dtype())?;
        let context = context.to_device(&device)?.to_dtype(self.dtype())?;
        Ok(self.model().model.forward(&latents, timestep, &context)?)
    }
}

impl TextEncoder for ResidentModel<clip::ClipTextTransformer> {
    fn encode(&self, tokens: &Tensor) -> Result<Tensor> {
        let tokens = tokens.to_device(&crate::models::Resident::device(self))?;
        Ok(self.model().forward(&tokens)?)
    }
}

pub struct Vae {
    model: vae::AutoEncoderKL,
    scale_factor: f64,
}

impl Autoencoder for ResidentModel<Vae> {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let device = crate::models::Resident::device(self);
        let images = images.to_device(&device)?.to_dtype(self.dtype())?;
        let vae = self.model();
        let latents = vae.model.encode(&images)?.sample()?;
        Ok((latents * vae.scale_factor)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let device = crate::models::Resident::device(self);
        let vae = self.model();
        let latents = (latents.to_device(&device)?.to_dtype(self.dtype())? / vae.scale_factor)?;
        Ok(vae.model.decode(&latents)?)
    }
}

impl LatentDecoder for ResidentModel<TinyDecoder> {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let device = crate::models::Resident::device(self);
        let latents = latents.to_device(&device)?.to_dtype(self.dtype())?;
        Ok(self.model().decode(&latents)?)
    }
}

/// Builds candle Stable Diffusion models from local files, falling back to the
/// hub for components a checkpoint does not contain.
pub struct CandleFactory {
    dirs: ModelDirectories,
    offline: bool,
}

impl CandleFactory {
    pub fn new(dirs: ModelDirectories) -> Self {
        Self {
            dirs,
            offline: false,
        }
    }

    /// Never reach out to the hub; missing local components become errors.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    fn hub(&self) -> Result<Api> {
        Ok(ApiBuilder::new()
            .with_cache_dir(self.dirs.hub_cache())
            .with_progress(false)
            .build()?)
    }

    /// Local auxiliary file `name`, or `file` from hub repository `repo`.
    fn fetch(&self, name: &str, (repo, file): (&str, &str)) -> Result<PathBuf> {
        if let Some(path) = self.dirs.locate(DirKind::Auxiliary, name, &[]) {
            return Ok(path);
        }
        if self.offline {
            return Err(Error::ModelNotFound(format!(
                "{name} is not in {}",
                self.dirs.dir(DirKind::Auxiliary).display()
            )));
        }
        tracing::info!(repo, file, "fetching from hub");
        Ok(self.hub()?.model(repo.to_string()).get(file)?)
    }

    fn config_dir(&self) -> PathBuf {
        self.dirs.dir(DirKind::Configs)
    }
}

fn read_safetensors(path: &Path) -> Result<WeightMap> {
    candle_core::safetensors::load(path, &candle_core::Device::Cpu).map_err(|e| Error::corrupt(path, e))
}

impl ModelFactory for CandleFactory {
    type Backbone = ResidentModel<Unet>;
    type TextEncoder = ResidentModel<clip::ClipTextTransformer>;
    type Autoencoder = ResidentModel<Vae>;
    type FastDecoder = ResidentModel<TinyDecoder>;
    type Tokenizer = ClipTokenizer;

    fn convert(&self, path: &Path, dtype: DType) -> Result<ConvertedCheckpoint> {
        let checkpoint = checkpoint::load(path)?;
        tracing::info!(path = %path.display(), tensors = checkpoint.len(), "checkpoint loaded");
        convert::convert_checkpoint(&checkpoint, &self.config_dir(), dtype)
    }

    fn layer_table(&self, descriptor: &FamilyDescriptor) -> LayerTable {
        let backbone = expected::unet_names(&descriptor.arch);
        let text_encoder = expected::clip_names(descriptor.arch.text_layers);
        LayerTable::new(
            backbone.iter().map(String::as_str),
            text_encoder.iter().map(String::as_str),
        )
    }

    fn backbone(
        &self,
        descriptor: &FamilyDescriptor,
        weights: WeightMap,
        placement: &Placement,
    ) -> Result<Self::Backbone> {
        let arch = descriptor.arch.clone();
        let use_flash_attn = cfg!(feature = "flash-attn");
        ResidentModel::new(
            weights,
            placement,
            Box::new(move |vb| {
                let model = unet_2d::UNet2DConditionModel::new(
                    vb,
                    arch.in_channels,
                    arch.out_channels,
                    use_flash_attn,
                    unet_config(&arch),
                )?;
                Ok(Unet {
                    model,
                    in_channels: arch.in_channels,
                })
            }),
        )
    }

    fn text_encoder(
        &self,
        descriptor: &FamilyDescriptor,
        weights: WeightMap,
        placement: &Placement,
    ) -> Result<Self::TextEncoder> {
        let config = match descriptor.family {
            Family::Sd1 => clip::Config::v1_5(),
        };
        if descriptor.arch.text_layers != 12 {
            return Err(Error::UnrecognizedArchitecture(format!(
                "text encoder with {} layers",
                descriptor.arch.text_layers
            )));
        }
        ResidentModel::new(
            weights,
            placement,
            Box::new(move |vb| clip::ClipTextTransformer::new(vb, &config)),
        )
    }

    fn autoencoder(&self, family: Family, placement: &Placement) -> Result<Self::Autoencoder> {
        let [name, _, _] = local_names(family);
        let path = self.fetch(name, hub_sources(family).autoencoder)?;
        let weights = read_safetensors(&path)?;
        let descriptor = FamilyDescriptor::sd1(false);
        let weights = if is_diffusers_layout(&weights) {
            weights
        } else {
            convert::convert(&weights, &descriptor, SubModel::Autoencoder)?
        };
        let arch = descriptor.arch.clone();
        ResidentModel::new(
            weights,
            placement,
            Box::new(move |vb| {
                let model = vae::AutoEncoderKL::new(vb, 3, 3, vae_config(&arch.vae))?;
                Ok(Vae {
                    model,
                    scale_factor: arch.scale_factor,
                })
            }),
        )
    }

    fn fast_decoder(&self, family: Family, placement: &Placement) -> Result<Self::FastDecoder> {
        let [_, name, _] = local_names(family);
        let path = self.fetch(name, hub_sources(family).fast_decoder)?;
        let weights = read_safetensors(&path)?;
        let layout = TinyLayout::detect(&weights);
        ResidentModel::new(weights, placement, Box::new(move |vb| TinyDecoder::new(vb, layout)))
    }

    fn tokenizer(&self, family: Family) -> Result<Self::Tokenizer> {
        let [_, _, name] = local_names(family);
        let path = self.fetch(name, hub_sources(family).tokenizer)?;
        ClipTokenizer::from_file(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd1_configs_match_reference_layout() {
        let arch = ArchConfig::sd1(false);
        let unet = unet_config(&arch);
        let channels: Vec<usize> = unet.blocks.iter().map(|b| b.out_channels).collect();
        assert_eq!(channels, vec![320, 640, 1280, 1280]);
        assert!(unet.blocks[..3].iter().all(|b| b.use_cross_attn == Some(1)));
        assert_eq!(unet.blocks[3].use_cross_attn, None);
        assert!(unet.blocks.iter().all(|b| b.attention_head_dim == 8));
        assert_eq!(unet.cross_attention_dim, 768);

        let vae = vae_config(&arch.vae);
        assert_eq!(vae.block_out_channels, vec![128, 256, 512, 512]);
        assert_eq!(vae.latent_channels, 4);
    }

    #[test]
    fn offline_factory_reports_missing_components() {
        let root = tempfile::tempdir().unwrap();
        let factory = CandleFactory::new(ModelDirectories::new(root.path())).offline(true);
        let err = factory.tokenizer(Family::Sd1).unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[test]
    fn layer_table_covers_text_encoder() {
        let factory = CandleFactory::new(ModelDirectories::new("."));
        let table = factory.layer_table(&FamilyDescriptor::sd1(false));
        assert!(table
            .resolve(
                crate::lora::LoraTarget::TextEncoder,
                "text_model_encoder_layers_0_self_attn_q_proj"
            )
            .is_some());
    }
}
