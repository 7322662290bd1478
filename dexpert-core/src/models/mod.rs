//! Seams between the cache and the model implementations. The cache only ever
//! sees these traits, so it can be driven by cheap stand-ins in tests.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;

use crate::checkpoint::{Family, FamilyDescriptor, WeightMap};
use crate::convert::ConvertedCheckpoint;
use crate::lora::LayerTable;
use crate::Result;

/// A sub-model shared between its cache slot and the pipelines using it. The lock
/// is held from resolution through execution.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Where a sub-model's tensors live and in which dtype.
#[derive(Debug, Clone)]
pub struct Placement {
    pub device: Device,
    pub dtype: DType,
}

impl Placement {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }
}

/// A sub-model whose tensors can move between devices.
pub trait Resident: Send {
    fn device(&self) -> Device;

    /// Moves every tensor to `device`. On failure the model stays where it was.
    fn relocate(&mut self, device: &Device) -> Result<()>;
}

pub trait Denoiser: Resident + 'static {
    fn in_channels(&self) -> usize;

    fn forward(&self, latents: &Tensor, timestep: f64, context: &Tensor) -> Result<Tensor>;
}

pub trait TextEncoder: Resident + 'static {
    fn encode(&self, tokens: &Tensor) -> Result<Tensor>;
}

/// Full autoencoder. Latents on both sides are already multiplied by the
/// latent scale factor; images are in [-1, 1].
pub trait Autoencoder: Resident + 'static {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;

    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

/// Cheap decoder used for previews and, on request, for the final image.
pub trait LatentDecoder: Resident + 'static {
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;
}

pub trait PromptTokenizer: Send + Sync + 'static {
    /// Token ids padded or truncated to the text encoder's context length.
    fn encode(&self, prompt: &str) -> Result<Vec<u32>>;
}

/// Everything the cache needs to turn files into sub-models.
///
/// `convert` and the component loaders may block on disk or network; the cache runs
/// them on its worker thread.
pub trait ModelFactory: Send + Sync + 'static {
    type Backbone: Denoiser;
    type TextEncoder: TextEncoder;
    type Autoencoder: Autoencoder;
    type FastDecoder: LatentDecoder;
    type Tokenizer: PromptTokenizer;

    /// Reads and converts the checkpoint at `path`. Tensors stay on the host.
    fn convert(&self, path: &Path, dtype: DType) -> Result<ConvertedCheckpoint>;

    /// Name table for adapters against the architecture in `descriptor`.
    fn layer_table(&self, descriptor: &FamilyDescriptor) -> LayerTable;

    fn backbone(
        &self,
        descriptor: &FamilyDescriptor,
        weights: WeightMap,
        placement: &Placement,
    ) -> Result<Self::Backbone>;

    fn text_encoder(
        &self,
        descriptor: &FamilyDescriptor,
        weights: WeightMap,
        placement: &Placement,
    ) -> Result<Self::TextEncoder>;

    fn autoencoder(&self, family: Family, placement: &Placement) -> Result<Self::Autoencoder>;

    fn fast_decoder(&self, family: Family, placement: &Placement) -> Result<Self::FastDecoder>;

    fn tokenizer(&self, family: Family) -> Result<Self::Tokenizer>;
}
