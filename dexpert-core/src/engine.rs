//! Request handling: settings, model resolution, memory pressure and the request
//! state machine around one generation.

use std::path::PathBuf;

use image::DynamicImage;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cache::{ModelCacheStore, ModelRequest};
use crate::catalog::{self, ModelEntry};
use crate::lora::AdapterSet;
use crate::memory::{DeviceProbe, MemoryProbe, Pressure, PressureGuard, PressurePolicy};
use crate::models::ModelFactory;
use crate::pipeline::{self, ExtraInputs, GenerationMode, PipelineCache, RunOutcome, RunParams};
use crate::schedule::ScheduleKind;
use crate::settings::{DirKind, ModelDirectories, Settings};
use crate::util::{round_to_latent_multiple, select_best_device};
use crate::{DeviceMap, Error, ErrorKind, GenerationRequest, Host, Precision, Result};

pub const MODEL_EXTENSIONS: [&str; 2] = ["safetensors", "ckpt"];

/// Lifecycle of one request. Terminal states are final; a canceled or failed
/// request is retried from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    ModelResolving,
    PipelineBuilding,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Pending, ModelResolving) | (ModelResolving, PipelineBuilding) | (PipelineBuilding, Running) => true,
            (Running, Completed) => true,
            (from, Canceled | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// What the host gets back for every request, successful or not.
#[derive(Debug, Serialize)]
pub struct GenerationOutcome {
    pub state: RequestState,
    #[serde(skip)]
    pub images: Vec<DynamicImage>,
    pub seed: u64,
    pub completed_steps: usize,
    pub width: usize,
    pub height: usize,
    /// The host's safety filter setting at the time of the request.
    pub apply_safety_filter: bool,
    pub error: Option<ErrorReport>,
}

struct Tracker {
    state: RequestState,
}

impl Tracker {
    fn advance(&mut self, next: RequestState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "request state");
            self.state = next;
        } else {
            tracing::warn!(from = ?self.state, to = ?next, "ignoring invalid request state transition");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Retain the unfused converted checkpoint so adapter changes skip disk reads.
    pub keep_in_memory: bool,
    pub policy: PressurePolicy,
}

pub struct Engine<F: ModelFactory> {
    cache: ModelCacheStore<F>,
    pipelines: PipelineCache<F>,
    settings: Settings,
    root: PathBuf,
    probe: Box<dyn MemoryProbe>,
    policy: PressurePolicy,
}

fn directories(root: &std::path::Path, settings: &Settings) -> ModelDirectories {
    ModelDirectories::new(root).with_extra(settings.add_model_dir())
}

impl<F: ModelFactory> Engine<F> {
    pub fn new(factory: F, root: impl Into<PathBuf>, settings: Settings, options: EngineOptions) -> Result<Self> {
        let root = root.into();
        let device = select_best_device(DeviceMap::from_setting(settings.device())?)?;
        tracing::info!(?device, root = %root.display(), "engine starting");
        let cache = ModelCacheStore::new(factory, directories(&root, &settings), device, options.keep_in_memory)?;
        Ok(Self {
            cache,
            pipelines: PipelineCache::default(),
            settings,
            root,
            probe: Box::new(DeviceProbe),
            policy: options.policy,
        })
    }

    pub fn with_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &ModelCacheStore<F> {
        &self.cache
    }

    pub fn pipelines(&self) -> &PipelineCache<F> {
        &self.pipelines
    }

    /// Merges host settings. Returns whether anything changed; a change bumps the
    /// settings epoch and so invalidates fused backbones and pipelines lazily.
    pub fn apply_settings(&mut self, updates: Map<String, Value>) -> Result<bool> {
        let mut next = self.settings.clone();
        if !next.apply(updates) {
            return Ok(false);
        }
        let device = select_best_device(DeviceMap::from_setting(next.device())?)?;
        if !device.same_device(self.cache.device()) {
            self.pipelines.clear();
        }
        self.cache.set_device(device);
        self.cache.set_directories(directories(&self.root, &next));
        self.settings = next;
        Ok(true)
    }

    pub fn models(&self) -> Vec<ModelEntry> {
        catalog::list_models(self.cache.directories())
    }

    pub fn adapters(&self) -> Vec<String> {
        catalog::list_adapters(self.cache.directories())
    }

    /// Drops every cached sub-model and pipeline.
    pub fn clear(&mut self) {
        self.pipelines.clear();
        self.cache.clear();
    }

    fn precision(&self) -> Precision {
        Precision::from_float16_flag(self.settings.use_float16()).for_device(self.cache.device())
    }

    fn resolve_model(&self, name: &str) -> Result<PathBuf> {
        self.cache
            .directories()
            .locate(DirKind::Models, name, &MODEL_EXTENSIONS)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    fn schedule(&self, request: &GenerationRequest) -> ScheduleKind {
        if request.use_lcm_lora {
            return ScheduleKind::from_name("LCMScheduler");
        }
        let name = request.scheduler.as_deref().unwrap_or(self.settings.scheduler());
        ScheduleKind::from_name(name)
    }

    /// Applies the pressure policy before a heavy operation on `partition`.
    fn relieve_pressure(&mut self, request: &ModelRequest) -> Result<PressureGuard> {
        let partition = request.key().partition;
        let occupancy = self.probe.occupancy(self.cache.device());
        match self.policy.assess(occupancy) {
            Pressure::Normal => Ok(PressureGuard::idle()),
            Pressure::Evict => {
                tracing::warn!(?occupancy, "critical memory pressure, evicting idle backbone");
                self.pipelines.evict_partition(partition.other());
                self.cache.evict(partition.other());
                Ok(PressureGuard::idle())
            }
            Pressure::Relocate => {
                PressureGuard::acquire(Pressure::Relocate, self.cache.idle_residents(partition))
            }
        }
    }

    /// Runs one request to completion. Never panics on model errors; every failure
    /// is reported through the outcome.
    pub fn generate(&mut self, request: &GenerationRequest, inputs: &ExtraInputs, host: &dyn Host) -> GenerationOutcome {
        let seed = request.seed.unwrap_or_else(|| rand::thread_rng().gen::<u32>() as u64);
        let mut tracker = Tracker {
            state: RequestState::Pending,
        };
        let result = self.execute(request, inputs, seed, host, &mut tracker);
        let width = round_to_latent_multiple(request.width());
        let height = round_to_latent_multiple(request.height());
        let apply_safety_filter = self.settings.nsfw_filter();

        let (images, completed_steps, error) = match result {
            Ok(RunOutcome::Completed {
                images,
                completed_steps,
            }) => {
                tracker.advance(RequestState::Completed);
                (images, completed_steps, None)
            }
            Ok(RunOutcome::Canceled { completed_steps }) => {
                tracker.advance(RequestState::Canceled);
                (Vec::new(), completed_steps, Some(ErrorReport::from(&Error::Canceled)))
            }
            Err(err) => {
                if matches!(err, Error::Canceled) {
                    tracker.advance(RequestState::Canceled);
                } else {
                    tracing::error!(%err, "generation failed");
                    tracker.advance(RequestState::Failed);
                }
                (Vec::new(), 0, Some(ErrorReport::from(&err)))
            }
        };
        GenerationOutcome {
            state: tracker.state,
            images,
            seed,
            completed_steps,
            width,
            height,
            apply_safety_filter,
            error,
        }
    }

    fn execute(
        &mut self,
        request: &GenerationRequest,
        inputs: &ExtraInputs,
        seed: u64,
        host: &dyn Host,
        tracker: &mut Tracker,
    ) -> Result<RunOutcome> {
        tracker.advance(RequestState::ModelResolving);
        if !request.controlnets.is_empty() {
            return Err(Error::InvalidInput(format!(
                "ControlNet conditioning is not supported (requested {})",
                request.controlnets.join(", ")
            )));
        }
        let mode = request.mode;
        let model_request = ModelRequest {
            model_path: self.resolve_model(&request.model)?,
            inpaint: mode == GenerationMode::Inpaint,
            adapters: AdapterSet::new(request.adapters.iter().cloned(), request.use_lcm_lora),
            settings_epoch: self.settings.epoch(),
            precision: self.precision(),
        };
        let guard = self.relieve_pressure(&model_request)?;
        let loaded = self.cache.get_or_build(&model_request, host)?;
        // Stale pipelines go only after a successful rebuild.
        self.pipelines.discard_stale(&loaded);

        tracker.advance(RequestState::PipelineBuilding);
        let schedule = self.schedule(request);
        let epoch = self.settings.epoch();
        let pipeline = self
            .pipelines
            .get_or_build(mode, schedule, &loaded, request.use_tiny_vae, epoch)?;
        drop(loaded);

        tracker.advance(RequestState::Running);
        host.report_status_text("Generating");
        let variation = request
            .variation_seed
            .map(|variation_seed| (variation_seed, request.variation_strength.unwrap_or(0.0)));
        let params = RunParams {
            prompt: request.prompt.clone(),
            negative_prompt: request.effective_negative_prompt().to_string(),
            guidance_scale: request.guidance(),
            steps: request.steps(),
            seed,
            width: request.width(),
            height: request.height(),
            batch_size: request.batch_size(),
            variation,
        };
        let outcome = pipeline::run(pipeline, &params, inputs, host)?;
        guard.release()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_follow_the_request_lifecycle() {
        use RequestState::*;
        assert!(Pending.can_transition_to(ModelResolving));
        assert!(ModelResolving.can_transition_to(PipelineBuilding));
        assert!(PipelineBuilding.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Canceled));
        assert!(ModelResolving.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Running));
        assert!(!ModelResolving.can_transition_to(Completed));
        assert!(!Canceled.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Canceled));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn error_reports_carry_kind_and_message() {
        let report = ErrorReport::from(&Error::AdapterNotFound("style".into()));
        assert_eq!(report.kind, ErrorKind::AdapterNotFound);
        assert!(report.message.contains("style"));
    }
}
