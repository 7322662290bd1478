use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    /// Parses the `device` setting: `cpu`, `cuda`, `cuda:N`, `mps`/`metal`.
    pub fn from_setting(name: &str) -> Result<Self> {
        let name = name.trim().to_lowercase();
        match name.as_str() {
            "cpu" => Ok(Self::ForceCpu),
            "cuda" | "gpu" | "mps" | "metal" | "" => Ok(Self::Ordinal(0)),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .or_else(|| other.strip_prefix("metal:"))
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| Error::InvalidInput(format!("unknown device {other}")))?;
                Ok(Self::Ordinal(ordinal))
            }
        }
    }
}

/// Floating point precision the sub-models are instantiated with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    F32,
}

impl Precision {
    pub fn from_float16_flag(use_float16: bool) -> Self {
        if use_float16 {
            Self::F16
        } else {
            Self::F32
        }
    }

    /// Half precision kernels are not worth it on the CPU backend.
    pub fn for_device(self, device: &Device) -> Self {
        if device.is_cpu() {
            Self::F32
        } else {
            self
        }
    }

    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_settings() {
        assert_eq!(DeviceMap::from_setting("cpu").unwrap(), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_setting("CUDA").unwrap(), DeviceMap::Ordinal(0));
        assert_eq!(DeviceMap::from_setting("cuda:2").unwrap(), DeviceMap::Ordinal(2));
        assert!(DeviceMap::from_setting("tpu").is_err());
    }

    #[test]
    fn cpu_downgrades_half_precision() {
        assert_eq!(Precision::F16.for_device(&Device::Cpu), Precision::F32);
        assert_eq!(Precision::from_float16_flag(true).dtype(), DType::F16);
    }
}
