//! Reading weight archives into flat key to tensor maps.

mod arch;
mod family;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

pub use arch::{ArchConfig, VaeArch};
pub use family::{detect, detect_inpaint, Family, FamilyDescriptor, STEM_KEY};

use crate::{Error, Result};

pub type WeightMap = HashMap<String, Tensor>;

const STATE_DICT_PREFIX: &str = "state_dict.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    SafeTensors,
    Pickle,
}

impl ContainerFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        match ext.as_deref() {
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("ckpt" | "pt" | "pth" | "bin") => Ok(Self::Pickle),
            _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// An archive as read from disk, in its original key layout.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    tensors: WeightMap,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>, tensors: WeightMap) -> Self {
        Self {
            path: path.into(),
            tensors,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tensors(&self) -> &WeightMap {
        &self.tensors
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn into_tensors(self) -> WeightMap {
        self.tensors
    }

    /// Strips the `state_dict.` wrapper from every key carrying it. Calling it again
    /// finds nothing left to strip.
    pub fn unwrap_state_dict(&mut self) -> bool {
        if !self.tensors.keys().any(|k| k.starts_with(STATE_DICT_PREFIX)) {
            return false;
        }
        self.tensors = std::mem::take(&mut self.tensors)
            .into_iter()
            .map(|(key, tensor)| match key.strip_prefix(STATE_DICT_PREFIX) {
                Some(inner) => (inner.to_string(), tensor),
                None => (key, tensor),
            })
            .collect();
        true
    }
}

/// Reads the archive at `path`, picking the reader by extension. Tensors land on the CPU.
pub fn load(path: &Path) -> Result<Checkpoint> {
    let format = ContainerFormat::from_path(path)?;
    if !path.is_file() {
        return Err(Error::ModelNotFound(path.display().to_string()));
    }
    tracing::debug!(path = %path.display(), ?format, "reading checkpoint");
    let tensors = match format {
        ContainerFormat::SafeTensors => candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| Error::corrupt(path, e))?,
        ContainerFormat::Pickle => read_pickle(path)?,
    };
    if tensors.is_empty() {
        return Err(Error::corrupt(path, "archive holds no tensors"));
    }
    let mut checkpoint = Checkpoint::new(path, tensors);
    checkpoint.unwrap_state_dict();
    Ok(checkpoint)
}

fn read_pickle(path: &Path) -> Result<WeightMap> {
    // Lightning checkpoints nest the weights under a `state_dict` entry.
    match candle_core::pickle::read_all_with_key(path, Some("state_dict")) {
        Ok(tensors) if !tensors.is_empty() => return Ok(tensors.into_iter().collect()),
        _ => {}
    }
    let tensors = candle_core::pickle::read_all(path).map_err(|e| Error::corrupt(path, e))?;
    Ok(tensors.into_iter().collect())
}
