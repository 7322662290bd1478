use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Tensor};

use super::{AdapterArchive, LoraGroup, LoraTarget};
use crate::checkpoint::WeightMap;
use crate::{Error, Result};

/// Maps the underscore-joined layer names adapters use onto dotted weight keys.
///
/// Built once per architecture from its parameter names. Underscore forms shared by
/// more than one key are kept out of the table; adapters naming them fail with a
/// layer mismatch instead of being fused into the wrong layer.
#[derive(Debug, Clone, Default)]
pub struct LayerTable {
    backbone: HashMap<String, String>,
    text_encoder: HashMap<String, String>,
    ambiguous: BTreeSet<String>,
}

fn underscore_form(key: &str) -> Option<String> {
    key.strip_suffix(".weight").map(|layer| layer.replace('.', "_"))
}

fn build_side<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    ambiguous: &mut BTreeSet<String>,
) -> HashMap<String, String> {
    let mut seen: HashMap<String, Vec<&'a str>> = HashMap::new();
    for key in keys {
        if let Some(name) = underscore_form(key) {
            seen.entry(name).or_default().push(key);
        }
    }
    seen.into_iter()
        .filter_map(|(name, keys)| match keys.as_slice() {
            [key] => Some((name, key.to_string())),
            _ => {
                tracing::debug!(layer = %name, candidates = keys.len(), "ambiguous adapter layer name");
                ambiguous.insert(name);
                None
            }
        })
        .collect()
}

impl LayerTable {
    pub fn new<'a>(
        backbone: impl IntoIterator<Item = &'a str>,
        text_encoder: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut ambiguous = BTreeSet::new();
        let backbone = build_side(backbone, &mut ambiguous);
        let text_encoder = build_side(text_encoder, &mut ambiguous);
        Self {
            backbone,
            text_encoder,
            ambiguous,
        }
    }

    pub fn resolve(&self, target: LoraTarget, layer: &str) -> Option<&str> {
        let side = match target {
            LoraTarget::Backbone => &self.backbone,
            LoraTarget::TextEncoder => &self.text_encoder,
        };
        side.get(layer).map(String::as_str)
    }

    pub fn is_ambiguous(&self, layer: &str) -> bool {
        self.ambiguous.contains(layer)
    }

    pub fn len(&self) -> usize {
        self.backbone.len() + self.text_encoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseReport {
    pub backbone_layers: usize,
    pub text_encoder_layers: usize,
}

/// `up @ down` shaped like the target weight, in f32.
fn low_rank_product(group: &LoraGroup, target_shape: &[usize]) -> Result<Tensor> {
    let up = group.up.to_dtype(DType::F32)?;
    let down = group.down.to_dtype(DType::F32)?;
    let product = match (up.dims(), down.dims()) {
        ([out, rank, 1, 1], [_, in_ch, 1, 1]) => {
            let up = up.reshape((*out, *rank))?;
            let down = down.reshape((*rank, *in_ch))?;
            up.matmul(&down)?
        }
        // Spatial down factor: contract over the rank axis, keep the kernel dims.
        ([out, rank, 1, 1], [_, in_ch, kh, kw]) => {
            let up = up.reshape((*out, *rank))?;
            let down = down.reshape((*rank, in_ch * kh * kw))?;
            up.matmul(&down)?.reshape((*out, *in_ch, *kh, *kw))?
        }
        ([_, _], [_, _]) => up.matmul(&down)?,
        (up_dims, down_dims) => {
            return Err(Error::AdapterLayerMismatch {
                adapter: String::new(),
                layer: format!("{} (factor shapes {up_dims:?} and {down_dims:?})", group.layer),
            })
        }
    };
    if product.elem_count() != target_shape.iter().product::<usize>() {
        return Err(Error::AdapterLayerMismatch {
            adapter: String::new(),
            layer: format!(
                "{} (delta {:?} does not fit {target_shape:?})",
                group.layer,
                product.dims()
            ),
        });
    }
    Ok(product.reshape(target_shape)?)
}

fn fuse_group(
    group: &LoraGroup,
    key: &str,
    weights: &mut WeightMap,
    weight: f32,
) -> Result<()> {
    let target = weights.get(key).ok_or_else(|| Error::AdapterLayerMismatch {
        adapter: String::new(),
        layer: key.to_string(),
    })?;
    let delta = (low_rank_product(group, target.dims())? * (weight * group.scale()) as f64)?;
    let fused = (target.to_dtype(DType::F32)? + delta.to_device(target.device())?)?
        .to_dtype(target.dtype())?;
    weights.insert(key.to_string(), fused);
    Ok(())
}

/// Adds `weight * alpha' * (up @ down)` to every layer `adapter` touches.
///
/// Every layer is resolved before any weight changes, so a mismatch leaves both
/// maps as they were.
pub fn fuse(
    backbone: &mut WeightMap,
    text_encoder: &mut WeightMap,
    table: &LayerTable,
    adapter: &AdapterArchive,
    weight: f32,
) -> Result<FuseReport> {
    let mismatch = |layer: String| Error::AdapterLayerMismatch {
        adapter: adapter.name.clone(),
        layer,
    };
    let mut resolved = Vec::with_capacity(adapter.groups.len());
    for group in &adapter.groups {
        let key = table.resolve(group.target, &group.layer).ok_or_else(|| {
            if table.is_ambiguous(&group.layer) {
                mismatch(format!("{} (ambiguous)", group.layer))
            } else {
                mismatch(group.layer.clone())
            }
        })?;
        resolved.push((group, key));
    }

    let mut report = FuseReport::default();
    for (group, key) in resolved {
        let weights = match group.target {
            LoraTarget::Backbone => {
                report.backbone_layers += 1;
                &mut *backbone
            }
            LoraTarget::TextEncoder => {
                report.text_encoder_layers += 1;
                &mut *text_encoder
            }
        };
        fuse_group(group, key, weights, weight).map_err(|err| match err {
            Error::AdapterLayerMismatch { layer, .. } => mismatch(layer),
            other => other,
        })?;
    }
    tracing::info!(
        adapter = %adapter.name,
        weight,
        backbone = report.backbone_layers,
        text_encoder = report.text_encoder_layers,
        "fused adapter"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn table() -> LayerTable {
        LayerTable::new(
            [
                "down_blocks.0.attentions.0.proj_in.weight",
                "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight",
                "down_blocks.0.attentions.0.proj_in.bias",
                "a.b_c.weight",
                "a_b.c.weight",
            ],
            ["text_model.encoder.layers.0.self_attn.q_proj.weight"],
        )
    }

    fn group(target: LoraTarget, layer: &str, up: Tensor, down: Tensor, alpha: Option<f32>) -> LoraGroup {
        LoraGroup {
            target,
            layer: layer.to_string(),
            up,
            down,
            alpha,
        }
    }

    #[test]
    fn underscore_names_resolve_to_dotted_keys() {
        let table = table();
        assert_eq!(
            table.resolve(LoraTarget::Backbone, "down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q"),
            Some("down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight")
        );
        assert_eq!(
            table.resolve(LoraTarget::TextEncoder, "text_model_encoder_layers_0_self_attn_q_proj"),
            Some("text_model.encoder.layers.0.self_attn.q_proj.weight")
        );
        assert!(table.resolve(LoraTarget::Backbone, "a_b_c").is_none());
        assert!(table.is_ambiguous("a_b_c"));
    }

    #[test]
    fn conv_factors_fuse_into_conv_weight() -> Result<()> {
        let dev = Device::Cpu;
        let mut backbone = WeightMap::new();
        backbone.insert(
            "down_blocks.0.attentions.0.proj_in.weight".into(),
            Tensor::zeros((4, 4, 1, 1), DType::F32, &dev)?,
        );
        let up = Tensor::ones((4, 2, 1, 1), DType::F32, &dev)?;
        let down = Tensor::ones((2, 4, 1, 1), DType::F32, &dev)?;
        let adapter = AdapterArchive {
            name: "conv".into(),
            groups: vec![group(LoraTarget::Backbone, "down_blocks_0_attentions_0_proj_in", up, down, Some(1.0))],
        };
        let report = fuse(&mut backbone, &mut WeightMap::new(), &table(), &adapter, 0.5)?;
        assert_eq!(report.backbone_layers, 1);
        let fused = &backbone["down_blocks.0.attentions.0.proj_in.weight"];
        assert_eq!(fused.dims(), &[4, 4, 1, 1]);
        // rank 2 ones product is 2, alpha' is 0.5, weight 0.5
        let values = fused.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (v - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn spatial_down_factor_keeps_kernel_dims() -> Result<()> {
        let dev = Device::Cpu;
        let group = group(
            LoraTarget::Backbone,
            "x",
            Tensor::ones((3, 2, 1, 1), DType::F32, &dev)?,
            Tensor::ones((2, 5, 3, 3), DType::F32, &dev)?,
            None,
        );
        let delta = low_rank_product(&group, &[3, 5, 3, 3])?;
        assert_eq!(delta.dims(), &[3, 5, 3, 3]);
        Ok(())
    }

    #[test]
    fn unresolved_layer_changes_nothing() -> Result<()> {
        let dev = Device::Cpu;
        let key = "text_model.encoder.layers.0.self_attn.q_proj.weight";
        let mut text = WeightMap::new();
        text.insert(key.into(), Tensor::zeros((4, 4), DType::F32, &dev)?);
        let ones = |shape: (usize, usize)| Tensor::ones(shape, DType::F32, &dev);
        let adapter = AdapterArchive {
            name: "partial".into(),
            groups: vec![
                group(LoraTarget::TextEncoder, "text_model_encoder_layers_0_self_attn_q_proj", ones((4, 1))?, ones((1, 4))?, None),
                group(LoraTarget::TextEncoder, "text_model_encoder_layers_9_mlp_fc1", ones((4, 1))?, ones((1, 4))?, None),
            ],
        };
        let err = fuse(&mut WeightMap::new(), &mut text, &table(), &adapter, 1.0).unwrap_err();
        assert!(matches!(err, Error::AdapterLayerMismatch { ref adapter, .. } if adapter == "partial"));
        assert_eq!(text[key].sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn half_precision_targets_stay_half() -> Result<()> {
        let dev = Device::Cpu;
        let key = "text_model.encoder.layers.0.self_attn.q_proj.weight";
        let mut text = WeightMap::new();
        text.insert(key.into(), Tensor::zeros((2, 2), DType::F16, &dev)?);
        let adapter = AdapterArchive {
            name: "half".into(),
            groups: vec![group(
                LoraTarget::TextEncoder,
                "text_model_encoder_layers_0_self_attn_q_proj",
                Tensor::ones((2, 1), DType::F16, &dev)?,
                Tensor::ones((1, 2), DType::F16, &dev)?,
                None,
            )],
        };
        fuse(&mut WeightMap::new(), &mut text, &table(), &adapter, 1.0)?;
        assert_eq!(text[key].dtype(), DType::F16);
        assert_eq!(text[key].to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?, 4.0);
        Ok(())
    }
}
