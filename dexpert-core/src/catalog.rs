//! Listings the host shows in its pickers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::lora::ADAPTER_EXTENSIONS;
use crate::schedule::{ScheduleKind, SCHEDULE_NAMES};
use crate::settings::{DirKind, ModelDirectories};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub path: PathBuf,
    /// Guessed from the file name; the stem convolution decides at load time.
    pub inpaint: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEntry {
    pub name: &'static str,
    pub runs_as: ScheduleKind,
}

fn files_with_extension(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext))
        })
        .collect();
    files.sort();
    files
}

/// Checkpoints in the model directory, then in the extra directory.
pub fn list_models(dirs: &ModelDirectories) -> Vec<ModelEntry> {
    dirs.search_path(DirKind::Models)
        .iter()
        .flat_map(|dir| files_with_extension(dir, &["safetensors"]))
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some(ModelEntry {
                inpaint: name.contains("inpaint"),
                name,
                path,
            })
        })
        .collect()
}

/// Adapter names without extension, unique, sorted case-insensitively.
pub fn list_adapters(dirs: &ModelDirectories) -> Vec<String> {
    let mut unique: BTreeMap<String, String> = BTreeMap::new();
    for dir in dirs.search_path(DirKind::Adapters) {
        for path in files_with_extension(&dir, &ADAPTER_EXTENSIONS) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                unique.entry(stem.to_string()).or_insert_with(|| stem.to_lowercase());
            }
        }
    }
    let mut names: Vec<(String, String)> = unique.into_iter().map(|(name, lower)| (lower, name)).collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

pub fn list_schedules() -> Vec<ScheduleEntry> {
    SCHEDULE_NAMES
        .iter()
        .map(|&name| ScheduleEntry {
            name,
            runs_as: ScheduleKind::from_name(name),
        })
        .collect()
}
