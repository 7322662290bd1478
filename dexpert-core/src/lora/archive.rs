use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Tensor};

use crate::checkpoint::{self, WeightMap};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoraTarget {
    Backbone,
    TextEncoder,
}

impl LoraTarget {
    fn split(key: &str) -> Option<(Self, &str)> {
        if let Some(rest) = key.strip_prefix("lora_unet_") {
            return Some((Self::Backbone, rest));
        }
        for prefix in ["lora_te_", "lora_te1_"] {
            if let Some(rest) = key.strip_prefix(prefix) {
                return Some((Self::TextEncoder, rest));
            }
        }
        None
    }
}

/// One layer's rank decomposition. `layer` is the underscore-joined layer path.
#[derive(Debug, Clone)]
pub struct LoraGroup {
    pub target: LoraTarget,
    pub layer: String,
    pub up: Tensor,
    pub down: Tensor,
    pub alpha: Option<f32>,
}

impl LoraGroup {
    pub fn rank(&self) -> usize {
        self.up.dims().get(1).copied().unwrap_or(1)
    }

    /// `alpha / rank` when alpha is stored, else 1.0.
    pub fn scale(&self) -> f32 {
        match self.alpha {
            Some(alpha) => alpha / self.rank().max(1) as f32,
            None => 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterArchive {
    pub name: String,
    pub groups: Vec<LoraGroup>,
}

#[derive(Default)]
struct Parts {
    up: Option<Tensor>,
    down: Option<Tensor>,
    alpha: Option<Tensor>,
}

impl AdapterArchive {
    pub fn load(name: &str, path: &Path) -> Result<Self> {
        let checkpoint = checkpoint::load(path)?;
        Self::from_tensors(name, checkpoint.into_tensors())
    }

    pub fn from_tensors(name: &str, tensors: WeightMap) -> Result<Self> {
        let mut parts: BTreeMap<(LoraTarget, String), Parts> = BTreeMap::new();
        for (key, tensor) in tensors {
            let Some((target, rest)) = LoraTarget::split(&key) else {
                tracing::warn!(adapter = name, key = %key, "skipping key without a known prefix");
                continue;
            };
            let (layer, slot) = if let Some(layer) = rest.strip_suffix(".lora_up.weight") {
                (layer, 0)
            } else if let Some(layer) = rest.strip_suffix(".lora_down.weight") {
                (layer, 1)
            } else if let Some(layer) = rest.strip_suffix(".alpha") {
                (layer, 2)
            } else {
                tracing::warn!(adapter = name, key = %key, "skipping unsupported adapter tensor");
                continue;
            };
            let entry = parts.entry((target, layer.to_string())).or_default();
            match slot {
                0 => entry.up = Some(tensor),
                1 => entry.down = Some(tensor),
                _ => entry.alpha = Some(tensor),
            }
        }

        let mut groups = Vec::with_capacity(parts.len());
        for ((target, layer), parts) in parts {
            let (Some(up), Some(down)) = (parts.up, parts.down) else {
                return Err(Error::AdapterLayerMismatch {
                    adapter: name.to_string(),
                    layer: format!("{layer} (incomplete up/down pair)"),
                });
            };
            let alpha = match parts.alpha {
                Some(alpha) => alpha
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .copied(),
                None => None,
            };
            groups.push(LoraGroup {
                target,
                layer,
                up,
                down,
                alpha,
            });
        }
        tracing::debug!(adapter = name, layers = groups.len(), "parsed adapter");
        Ok(Self {
            name: name.to_string(),
            groups,
        })
    }

    pub fn touches(&self, target: LoraTarget) -> bool {
        self.groups.iter().any(|g| g.target == target)
    }
}
