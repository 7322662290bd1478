//! Tiny latent decoder (TAESD) used for step previews and fast final decodes.
//!
//! Weights come in two layouts: the diffusers one (`decoder.layers.N.`) and the
//! original one, where index 0 is a parameterless clamp and every other layer
//! sits one index higher.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

use crate::checkpoint::WeightMap;

const CHANNELS: usize = 64;
const LATENT_CHANNELS: usize = 4;
/// Blocks per stage, with a 2x upsampling between stages.
const STAGES: [usize; 4] = [3, 3, 3, 1];
const LATENT_CLAMP: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TinyLayout {
    Diffusers,
    Original,
}

impl TinyLayout {
    pub fn detect(weights: &WeightMap) -> Self {
        if weights.keys().any(|k| k.starts_with("decoder.layers.")) {
            Self::Diffusers
        } else {
            Self::Original
        }
    }

    fn root<'a>(self, vb: VarBuilder<'a>) -> VarBuilder<'a> {
        match self {
            Self::Diffusers => vb.pp("decoder").pp("layers"),
            Self::Original => vb,
        }
    }

    fn offset(self) -> usize {
        match self {
            Self::Diffusers => 0,
            Self::Original => 1,
        }
    }
}

fn conv3(channels_in: usize, channels_out: usize, bias: bool, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    if bias {
        conv2d(channels_in, channels_out, 3, cfg, vb)
    } else {
        conv2d_no_bias(channels_in, channels_out, 3, cfg, vb)
    }
}

#[derive(Debug, Clone)]
struct Block {
    convs: [Conv2d; 3],
}

impl Block {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp("conv");
        Ok(Self {
            convs: [
                conv3(channels, channels, true, vb.pp("0"))?,
                conv3(channels, channels, true, vb.pp("2"))?,
                conv3(channels, channels, true, vb.pp("4"))?,
            ],
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let [first, second, third] = &self.convs;
        let ys = first.forward(xs)?.relu()?;
        let ys = second.forward(&ys)?.relu()?;
        let ys = third.forward(&ys)?;
        (ys + xs)?.relu()
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Relu,
    Block(Block),
    Upsample,
}

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Layer::Conv(conv) => conv.forward(xs),
            Layer::Relu => xs.relu(),
            Layer::Block(block) => block.forward(xs),
            Layer::Upsample => {
                let (_, _, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(h * 2, w * 2)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TinyDecoder {
    layers: Vec<Layer>,
}

impl TinyDecoder {
    pub fn new(vb: VarBuilder, layout: TinyLayout) -> candle_core::Result<Self> {
        let vb = layout.root(vb);
        let mut index = layout.offset();
        let mut next = || {
            let current = index;
            index += 1;
            current.to_string()
        };

        let mut layers = vec![Layer::Conv(conv3(LATENT_CHANNELS, CHANNELS, true, vb.pp(next()))?)];
        next();
        layers.push(Layer::Relu);
        for (stage, blocks) in STAGES.iter().enumerate() {
            for _ in 0..*blocks {
                layers.push(Layer::Block(Block::new(CHANNELS, vb.pp(next()))?));
            }
            let last = stage + 1 == STAGES.len();
            if last {
                layers.push(Layer::Conv(conv3(CHANNELS, 3, true, vb.pp(next()))?));
            } else {
                next();
                layers.push(Layer::Upsample);
                layers.push(Layer::Conv(conv3(CHANNELS, CHANNELS, false, vb.pp(next()))?));
            }
        }
        Ok(Self { layers })
    }

    /// Decodes backbone-space latents into images in [-1, 1].
    pub fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = ((latents / LATENT_CLAMP)?.tanh()? * LATENT_CLAMP)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        (xs * 2.0)? - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn original_layout_is_offset_by_one() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TinyDecoder::new(vb, TinyLayout::Original).unwrap();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"1.weight".to_string()));
        assert!(names.contains(&"3.conv.4.bias".to_string()));
        assert!(names.contains(&"7.weight".to_string()));
        assert!(!names.contains(&"7.bias".to_string()));
        assert!(names.contains(&"19.bias".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("0.")));
    }

    #[test]
    fn decodes_to_eight_times_the_latent_size() -> candle_core::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = TinyDecoder::new(vb, TinyLayout::Diffusers)?;
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"decoder.layers.0.weight".to_string()));
        assert!(names.contains(&"decoder.layers.18.weight".to_string()));

        let latents = Tensor::zeros((1, 4, 2, 3), DType::F32, &Device::Cpu)?;
        let image = decoder.decode(&latents)?;
        assert_eq!(image.dims(), &[1, 3, 16, 24]);
        Ok(())
    }
}
