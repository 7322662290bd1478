use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::checkpoint::WeightMap;
use crate::models::{Placement, Resident};
use crate::Result;

pub(crate) type Builder<M> = Box<dyn Fn(VarBuilder) -> candle_core::Result<M> + Send + Sync>;

/// A candle module together with the weights it was built from.
///
/// candle modules cannot move their parameters in place, so relocation moves the
/// weight map and builds a fresh module on the target device. The tensors are
/// shared between the map and the module, keeping one copy in memory.
pub struct ResidentModel<M> {
    weights: WeightMap,
    dtype: DType,
    device: Device,
    model: M,
    build: Builder<M>,
}

fn place(weights: &WeightMap, device: &Device, dtype: DType) -> Result<WeightMap> {
    weights
        .iter()
        .map(|(name, tensor)| Ok((name.clone(), tensor.to_device(device)?.to_dtype(dtype)?)))
        .collect()
}

impl<M> ResidentModel<M> {
    pub(crate) fn new(weights: WeightMap, placement: &Placement, build: Builder<M>) -> Result<Self> {
        let weights = place(&weights, &placement.device, placement.dtype)?;
        let vb = VarBuilder::from_tensors(weights.clone(), placement.dtype, &placement.device);
        let model = build(vb)?;
        Ok(Self {
            weights,
            dtype: placement.dtype,
            device: placement.device.clone(),
            model,
            build,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl<M: Send> Resident for ResidentModel<M> {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn relocate(&mut self, device: &Device) -> Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }
        let weights = place(&self.weights, device, self.dtype)?;
        let vb = VarBuilder::from_tensors(weights.clone(), self.dtype, device);
        let model = (self.build)(vb)?;
        self.weights = weights;
        self.model = model;
        self.device = device.clone();
        tracing::debug!(?device, "relocated sub-model");
        Ok(())
    }
}
