//! Host-supplied flat configuration and the directory layout derived from it.
//!
//! Every change that alters a stored value bumps the settings epoch. Caches key
//! on the epoch instead of enumerating individual settings.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::{Error, Result};

pub const USE_FLOAT16: &str = "use_float16";
pub const SCHEDULER: &str = "scheduler";
pub const NSFW_FILTER: &str = "nsfw_filter";
pub const DEVICE: &str = "device";
pub const ADD_MODEL_DIR: &str = "directories.add_model_dir";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: Map<String, Value>,
    epoch: u64,
}

impl Settings {
    pub fn from_values(values: Map<String, Value>) -> Self {
        Self { values, epoch: 0 }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidInput(format!("settings file {}: {e}", path.display())))?;
        match value {
            Value::Object(values) => Ok(Self::from_values(values)),
            _ => Err(Error::InvalidInput(format!(
                "settings file {} is not an object",
                path.display()
            ))),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Merges `updates` into the stored values. Returns whether anything changed.
    pub fn apply(&mut self, updates: Map<String, Value>) -> bool {
        let mut changed = false;
        for (key, value) in updates {
            if self.values.get(&key) != Some(&value) {
                self.values.insert(key, value);
                changed = true;
            }
        }
        if changed {
            self.epoch += 1;
            tracing::info!(epoch = self.epoch, "settings changed");
        }
        changed
    }

    pub fn set(&mut self, key: &str, value: Value) -> bool {
        let mut updates = Map::new();
        updates.insert(key.to_string(), value);
        self.apply(updates)
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.values.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn use_float16(&self) -> bool {
        self.bool_or(USE_FLOAT16, true)
    }

    pub fn scheduler(&self) -> &str {
        self.str_or(SCHEDULER, "PNDMScheduler")
    }

    pub fn nsfw_filter(&self) -> bool {
        self.bool_or(NSFW_FILTER, true)
    }

    pub fn device(&self) -> &str {
        self.str_or(DEVICE, "cuda")
    }

    pub fn add_model_dir(&self) -> Option<PathBuf> {
        self.values
            .get(ADD_MODEL_DIR)
            .and_then(Value::as_str)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Models,
    Adapters,
    Auxiliary,
    Configs,
}

impl DirKind {
    fn dir_name(self) -> &'static str {
        match self {
            DirKind::Models => "models",
            DirKind::Adapters => "lora",
            DirKind::Auxiliary => "vae",
            DirKind::Configs => "configs",
        }
    }
}

/// Directory layout under the data root, plus the user-configured extra directory
/// searched after the primary one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDirectories {
    root: PathBuf,
    extra: Option<PathBuf>,
}

impl ModelDirectories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Option<PathBuf>) -> Self {
        self.extra = extra;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extra(&self) -> Option<&Path> {
        self.extra.as_deref()
    }

    pub fn dir(&self, kind: DirKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn hub_cache(&self) -> PathBuf {
        self.root.join("hub")
    }

    /// Directories searched for `kind`, in order.
    pub fn search_path(&self, kind: DirKind) -> Vec<PathBuf> {
        let mut dirs = vec![self.dir(kind)];
        if matches!(kind, DirKind::Models | DirKind::Adapters) {
            if let Some(extra) = &self.extra {
                dirs.push(extra.clone());
            }
        }
        dirs
    }

    /// Resolves `name` against the search path. A name without an extension also
    /// matches `<name>.<ext>` for each of `extensions`.
    pub fn locate(&self, kind: DirKind, name: &str, extensions: &[&str]) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() && direct.is_file() {
            return Some(direct.to_path_buf());
        }
        for dir in self.search_path(kind) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
            if direct.extension().is_none() {
                for ext in extensions {
                    let candidate = dir.join(format!("{name}.{ext}"));
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}
