//! In-memory stand-ins for the candle sub-models, counting every build.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;

use dexpert_core::checkpoint::{self, Family, FamilyDescriptor, WeightMap, STEM_KEY};
use dexpert_core::convert::ConvertedCheckpoint;
use dexpert_core::lora::LayerTable;
use dexpert_core::models::{
    Autoencoder, Denoiser, LatentDecoder, ModelFactory, Placement, PromptTokenizer, Resident, TextEncoder,
};
use dexpert_core::{CancellationToken, Result};

pub const BACKBONE_LAYER: &str = "down.proj.weight";
pub const TEXT_LAYER: &str = "text.proj.weight";

#[derive(Debug, Default)]
pub struct Counters {
    pub convert: AtomicUsize,
    pub backbone: AtomicUsize,
    pub text_encoder: AtomicUsize,
    pub autoencoder: AtomicUsize,
    pub fast_decoder: AtomicUsize,
    pub tokenizer: AtomicUsize,
    pub forward: AtomicUsize,
    pub relocations: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Cancels the token when the backbone runs its n-th forward pass overall.
pub type CancelPlan = Arc<Mutex<Option<(usize, CancellationToken)>>>;

#[derive(Clone, Default)]
pub struct ToyFactory {
    pub counters: Arc<Counters>,
    pub cancel_plan: CancelPlan,
}

fn bump(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

pub struct ToyBackbone {
    pub weights: WeightMap,
    in_channels: usize,
    counters: Arc<Counters>,
    cancel_plan: CancelPlan,
}

impl Resident for ToyBackbone {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn relocate(&mut self, _device: &Device) -> Result<()> {
        bump(&self.counters.relocations);
        Ok(())
    }
}

impl Denoiser for ToyBackbone {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(&self, latents: &Tensor, _timestep: f64, _context: &Tensor) -> Result<Tensor> {
        let call = bump(&self.counters.forward);
        if let Some((at, token)) = &*self.cancel_plan.lock() {
            if call == *at {
                token.cancel();
            }
        }
        Ok(latents.narrow(1, 0, 4)?.zeros_like()?)
    }
}

pub struct ToyTextEncoder {
    pub weights: WeightMap,
}

impl Resident for ToyTextEncoder {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn relocate(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

impl TextEncoder for ToyTextEncoder {
    fn encode(&self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, len) = tokens.dims2()?;
        Ok(Tensor::zeros((batch, len, 8), DType::F32, &Device::Cpu)?)
    }
}

pub struct ToyAutoencoder;

impl Resident for ToyAutoencoder {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn relocate(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

impl Autoencoder for ToyAutoencoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let (batch, _, h, w) = images.dims4()?;
        Ok(Tensor::zeros((batch, 4, h / 8, w / 8), DType::F32, &Device::Cpu)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (batch, _, h, w) = latents.dims4()?;
        Ok(Tensor::zeros((batch, 3, h * 8, w * 8), DType::F32, &Device::Cpu)?)
    }
}

impl LatentDecoder for ToyAutoencoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Autoencoder::decode(self, latents)
    }
}

pub struct ToyTokenizer;

impl PromptTokenizer for ToyTokenizer {
    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = prompt.bytes().map(u32::from).take(77).collect();
        ids.resize(77, 0);
        Ok(ids)
    }
}

impl ModelFactory for ToyFactory {
    type Backbone = ToyBackbone;
    type TextEncoder = ToyTextEncoder;
    type Autoencoder = ToyAutoencoder;
    type FastDecoder = ToyAutoencoder;
    type Tokenizer = ToyTokenizer;

    fn convert(&self, path: &Path, dtype: DType) -> Result<ConvertedCheckpoint> {
        bump(&self.counters.convert);
        let checkpoint = checkpoint::load(path)?;
        let inpaint = checkpoint::detect_inpaint(checkpoint.tensors())?;
        let mut backbone = WeightMap::new();
        backbone.insert(BACKBONE_LAYER.to_string(), Tensor::zeros((4, 4), dtype, &Device::Cpu)?);
        let mut text_encoder = WeightMap::new();
        text_encoder.insert(TEXT_LAYER.to_string(), Tensor::zeros((4, 4), dtype, &Device::Cpu)?);
        Ok(ConvertedCheckpoint {
            descriptor: FamilyDescriptor::sd1(inpaint),
            backbone,
            text_encoder,
        })
    }

    fn layer_table(&self, _descriptor: &FamilyDescriptor) -> LayerTable {
        LayerTable::new([BACKBONE_LAYER], [TEXT_LAYER])
    }

    fn backbone(
        &self,
        descriptor: &FamilyDescriptor,
        weights: WeightMap,
        _placement: &Placement,
    ) -> Result<Self::Backbone> {
        bump(&self.counters.backbone);
        Ok(ToyBackbone {
            weights,
            in_channels: descriptor.arch.in_channels,
            counters: self.counters.clone(),
            cancel_plan: self.cancel_plan.clone(),
        })
    }

    fn text_encoder(
        &self,
        _descriptor: &FamilyDescriptor,
        weights: WeightMap,
        _placement: &Placement,
    ) -> Result<Self::TextEncoder> {
        bump(&self.counters.text_encoder);
        Ok(ToyTextEncoder { weights })
    }

    fn autoencoder(&self, _family: Family, _placement: &Placement) -> Result<Self::Autoencoder> {
        bump(&self.counters.autoencoder);
        Ok(ToyAutoencoder)
    }

    fn fast_decoder(&self, _family: Family, _placement: &Placement) -> Result<Self::FastDecoder> {
        bump(&self.counters.fast_decoder);
        Ok(ToyAutoencoder)
    }

    fn tokenizer(&self, _family: Family) -> Result<Self::Tokenizer> {
        bump(&self.counters.tokenizer);
        Ok(ToyTokenizer)
    }
}

/// Writes a checkpoint holding only a stem convolution with `in_channels` inputs.
pub fn write_checkpoint(dir: &Path, name: &str, in_channels: usize) -> std::path::PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    let mut tensors = HashMap::new();
    tensors.insert(
        STEM_KEY.to_string(),
        Tensor::zeros((8, in_channels, 3, 3), DType::F32, &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, &path).unwrap();
    path
}

/// Writes a rank-1 adapter whose delta is all ones before scaling. `layers` are
/// full prefixed layer names, e.g. `lora_unet_down_proj`.
pub fn write_adapter(dir: &Path, name: &str, layers: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut tensors = HashMap::new();
    for layer in layers {
        tensors.insert(
            format!("{layer}.lora_up.weight"),
            Tensor::ones((4, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            format!("{layer}.lora_down.weight"),
            Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(format!("{layer}.alpha"), Tensor::new(&[1f32], &Device::Cpu).unwrap());
    }
    candle_core::safetensors::save(&tensors, dir.join(format!("{name}.safetensors"))).unwrap();
}

pub fn values(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}
