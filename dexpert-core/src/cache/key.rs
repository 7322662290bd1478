use std::path::PathBuf;

use serde::Serialize;

use crate::checkpoint::Family;
use crate::lora::AdapterSet;
use crate::Precision;

/// Backbone partition: one slot for inpainting-capable checkpoints, one for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Standard,
    Inpaint,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Standard, Partition::Inpaint];

    pub fn from_inpaint(inpaint: bool) -> Self {
        if inpaint {
            Self::Inpaint
        } else {
            Self::Standard
        }
    }

    pub fn is_inpaint(self) -> bool {
        self == Self::Inpaint
    }

    pub fn other(self) -> Self {
        match self {
            Self::Standard => Self::Inpaint,
            Self::Inpaint => Self::Standard,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Standard => 0,
            Self::Inpaint => 1,
        }
    }
}

/// Everything a backbone slot is keyed on. The first three fields form the primary
/// axis, adapters and settings epoch the secondary one. ControlNets never reach
/// the cache, so they are not an axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub model_path: PathBuf,
    pub precision: Precision,
    pub partition: Partition,
    pub adapters: AdapterSet,
    pub settings_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The cached backbone can be reused as is.
    None,
    /// Same base weights, different fusion: the backbone is rebuilt, the other
    /// sub-models are kept.
    Adapters,
    /// Different checkpoint or precision: everything in the slot is rebuilt.
    Full,
}

impl CacheKey {
    pub fn primary_matches(&self, other: &CacheKey) -> bool {
        self.model_path == other.model_path
            && self.precision == other.precision
            && self.partition == other.partition
    }

    /// What has to be rebuilt to go from `self` to `next`.
    pub fn invalidation(&self, next: &CacheKey) -> Invalidation {
        if !self.primary_matches(next) {
            Invalidation::Full
        } else if self.adapters != next.adapters || self.settings_epoch != next.settings_epoch {
            Invalidation::Adapters
        } else {
            Invalidation::None
        }
    }
}

/// Key of the components shared by every checkpoint of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub family: Family,
    pub precision: Precision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::AdapterSpec;

    fn key() -> CacheKey {
        CacheKey {
            model_path: PathBuf::from("models/a.safetensors"),
            precision: Precision::F16,
            partition: Partition::Standard,
            adapters: AdapterSet::default(),
            settings_epoch: 0,
        }
    }

    #[test]
    fn classifies_changes_by_axis() {
        let base = key();
        assert_eq!(base.invalidation(&base.clone()), Invalidation::None);

        let epoch = CacheKey { settings_epoch: 1, ..key() };
        assert_eq!(base.invalidation(&epoch), Invalidation::Adapters);

        let adapters = CacheKey {
            adapters: AdapterSet::new([AdapterSpec::new("style", 0.8)], false),
            ..key()
        };
        assert_eq!(base.invalidation(&adapters), Invalidation::Adapters);

        let precision = CacheKey { precision: Precision::F32, ..adapters.clone() };
        assert_eq!(adapters.invalidation(&precision), Invalidation::Full);

        let path = CacheKey { model_path: PathBuf::from("models/b.safetensors"), ..key() };
        assert_eq!(base.invalidation(&path), Invalidation::Full);
    }
}
