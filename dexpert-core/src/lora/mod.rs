//! Low-rank adapters: descriptors, archive parsing and fusion into base weights.

mod archive;
mod fuse;

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use archive::{AdapterArchive, LoraGroup, LoraTarget};
pub use fuse::{fuse, FuseReport, LayerTable};

use crate::settings::{DirKind, ModelDirectories};
use crate::{Error, Result};

/// Adapter appended when latent-consistency sampling is requested.
pub const LCM_ADAPTER: &str = "lcm-lora-sdv1-5";
pub const ADAPTER_EXTENSIONS: [&str; 4] = ["safetensors", "ckpt", "pt", "bin"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

impl AdapterSpec {
    pub fn new(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

// Weights compare bitwise so that specs can key caches.
impl PartialEq for AdapterSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.weight.to_bits() == other.weight.to_bits()
    }
}

impl Eq for AdapterSpec {}

impl Hash for AdapterSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.weight.to_bits().hash(state);
    }
}

impl Ord for AdapterSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.weight.total_cmp(&other.weight))
    }
}

impl PartialOrd for AdapterSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The adapters requested for one generation, order-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AdapterSet {
    adapters: Vec<AdapterSpec>,
    lcm: bool,
}

impl AdapterSet {
    pub fn new(adapters: impl IntoIterator<Item = AdapterSpec>, lcm: bool) -> Self {
        let mut adapters: Vec<_> = adapters.into_iter().collect();
        adapters.sort();
        Self { adapters, lcm }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty() && !self.lcm
    }

    pub fn adapters(&self) -> &[AdapterSpec] {
        &self.adapters
    }

    /// What actually gets fused: user adapters with normalized weights, then the
    /// latent-consistency adapter at full weight.
    pub fn fusion_plan(&self) -> Vec<AdapterSpec> {
        let weights: Vec<f32> = self.adapters.iter().map(|a| a.weight).collect();
        let mut plan: Vec<AdapterSpec> = self
            .adapters
            .iter()
            .zip(normalize_weights(&weights))
            .map(|(adapter, weight)| AdapterSpec::new(adapter.name.clone(), weight))
            .collect();
        if self.lcm {
            plan.push(AdapterSpec::new(LCM_ADAPTER, 1.0));
        }
        plan
    }
}

/// With several adapters whose weights add up to more than 1.0, rescales them
/// proportionally to sum to 1.0.
pub fn normalize_weights(weights: &[f32]) -> Vec<f32> {
    let total: f32 = weights.iter().sum();
    if weights.len() > 1 && total > 1.0 {
        weights.iter().map(|w| w / total).collect()
    } else {
        weights.to_vec()
    }
}

/// Resolves an adapter name against the adapter directory, then the extra directory.
pub fn locate(dirs: &ModelDirectories, name: &str) -> Result<PathBuf> {
    dirs.locate(DirKind::Adapters, name, &ADAPTER_EXTENSIONS)
        .ok_or_else(|| Error::AdapterNotFound(name.to_string()))
}
