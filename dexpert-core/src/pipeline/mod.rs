//! Pipeline assembly and the per-mode pipeline cache.

mod executor;
mod inputs;

use serde::{Deserialize, Serialize};

pub use executor::{run, RunOutcome, RunParams};
pub use inputs::{image_to_tensor, mask_to_tensor, ExtraInputs, DEFAULT_STRENGTH};

use crate::cache::{LoadedModel, Partition};
use crate::models::{Denoiser, ModelFactory};
use crate::schedule::ScheduleKind;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GenerationMode {
    #[default]
    #[serde(rename = "txt2img")]
    Txt2Img,
    #[serde(rename = "img2img")]
    Img2Img,
    #[serde(rename = "inpaint")]
    Inpaint,
}

serde_plain::derive_display_from_serialize!(GenerationMode);
serde_plain::derive_fromstr_from_deserialize!(GenerationMode);

impl GenerationMode {
    pub const ALL: [GenerationMode; 3] = [Self::Txt2Img, Self::Img2Img, Self::Inpaint];

    pub fn partition(self) -> Partition {
        Partition::from_inpaint(self == Self::Inpaint)
    }

    fn index(self) -> usize {
        match self {
            Self::Txt2Img => 0,
            Self::Img2Img => 1,
            Self::Inpaint => 2,
        }
    }
}

/// Everything a cached pipeline depends on. There is no ControlNet axis: requests
/// carrying ControlNet inputs are refused before a pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub mode: GenerationMode,
    pub generation: u64,
    pub components: u64,
    pub schedule: ScheduleKind,
    pub tiny_decoder: bool,
    pub settings_epoch: u64,
}

/// A ready-to-run combination of sub-models and a noise schedule for one mode.
pub struct Pipeline<F: ModelFactory> {
    key: PipelineKey,
    model: LoadedModel<F>,
}

impl<F: ModelFactory> Pipeline<F> {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn mode(&self) -> GenerationMode {
        self.key.mode
    }

    pub fn schedule(&self) -> ScheduleKind {
        self.key.schedule
    }

    pub fn uses_tiny_decoder(&self) -> bool {
        self.key.tiny_decoder
    }

    pub fn model(&self) -> &LoadedModel<F> {
        &self.model
    }
}

/// Checks that `model` can serve `mode` and assembles the pipeline.
pub fn build<F: ModelFactory>(
    mode: GenerationMode,
    schedule: ScheduleKind,
    model: LoadedModel<F>,
    tiny_decoder: bool,
    settings_epoch: u64,
) -> Result<Pipeline<F>> {
    let inpaint_model = model.descriptor.inpaint;
    let wants_inpaint = mode == GenerationMode::Inpaint;
    if inpaint_model != wants_inpaint {
        return Err(Error::IncompatibleModelMode {
            mode: mode.to_string(),
            reason: if inpaint_model {
                "the model is an inpainting checkpoint".to_string()
            } else {
                "the model is not an inpainting checkpoint".to_string()
            },
        });
    }
    let expected_channels = if wants_inpaint { 9 } else { 4 };
    let channels = model.backbone.lock().in_channels();
    if channels != expected_channels {
        return Err(Error::IncompatibleModelMode {
            mode: mode.to_string(),
            reason: format!("backbone takes {channels} input channels"),
        });
    }
    Ok(Pipeline {
        key: PipelineKey {
            mode,
            generation: model.generation,
            components: model.components,
            schedule,
            tiny_decoder,
            settings_epoch,
        },
        model,
    })
}

/// One pipeline slot per generation mode.
pub struct PipelineCache<F: ModelFactory> {
    slots: [Option<Pipeline<F>>; 3],
}

impl<F: ModelFactory> Default for PipelineCache<F> {
    fn default() -> Self {
        Self {
            slots: [None, None, None],
        }
    }
}

impl<F: ModelFactory> PipelineCache<F> {
    /// Returns the cached pipeline for `mode` when its key matches, otherwise
    /// replaces it. A failed build leaves the slot as it was.
    pub fn get_or_build(
        &mut self,
        mode: GenerationMode,
        schedule: ScheduleKind,
        model: &LoadedModel<F>,
        tiny_decoder: bool,
        settings_epoch: u64,
    ) -> Result<&Pipeline<F>> {
        let key = PipelineKey {
            mode,
            generation: model.generation,
            components: model.components,
            schedule,
            tiny_decoder,
            settings_epoch,
        };
        let slot = &mut self.slots[mode.index()];
        match slot {
            Some(pipeline) if pipeline.key == key => {
                tracing::debug!(%mode, "pipeline cache hit");
            }
            _ => {
                let pipeline = build(mode, schedule, model.clone(), tiny_decoder, settings_epoch)?;
                tracing::info!(%mode, %schedule, "built pipeline");
                *slot = Some(pipeline);
            }
        }
        slot.as_ref()
            .ok_or_else(|| Error::ModelNotFound(format!("{mode} pipeline")))
    }

    pub fn get(&self, mode: GenerationMode) -> Option<&Pipeline<F>> {
        self.slots[mode.index()].as_ref()
    }

    /// Drops every pipeline built on `partition`'s backbone so its memory can be
    /// reclaimed once the cache slot lets go as well.
    pub fn evict_partition(&mut self, partition: Partition) -> usize {
        let mut evicted = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|p| p.model.partition == partition) {
                *slot = None;
                evicted += 1;
            }
        }
        evicted
    }

    /// Drops pipelines holding sub-models that `current` has replaced.
    pub fn discard_stale(&mut self, current: &LoadedModel<F>) {
        for slot in &mut self.slots {
            let stale = slot.as_ref().is_some_and(|p| {
                let replaced_backbone =
                    p.model.partition == current.partition && p.key.generation != current.generation;
                replaced_backbone || p.key.components != current.components
            });
            if stale {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None, None, None];
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip_through_strings() {
        assert_eq!(GenerationMode::Img2Img.to_string(), "img2img");
        assert_eq!("inpaint".parse::<GenerationMode>().unwrap(), GenerationMode::Inpaint);
        assert!("outpaint".parse::<GenerationMode>().is_err());
        assert_eq!(GenerationMode::Inpaint.partition(), Partition::Inpaint);
        assert_eq!(GenerationMode::Img2Img.partition(), Partition::Standard);
    }
}
