//! Noise schedules available to pipelines and the mapping from the schedule names
//! hosts send.

use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{Scheduler, SchedulerConfig};
use candle_transformers::models::stable_diffusion::uni_pc::{TimestepSchedule, UniPCSchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::checkpoint::ArchConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Ddim,
    #[default]
    EulerAncestral,
    UniPc,
}

serde_plain::derive_display_from_serialize!(ScheduleKind);
serde_plain::derive_fromstr_from_deserialize!(ScheduleKind);

/// Schedule names accepted from hosts, in the order they are listed.
pub const SCHEDULE_NAMES: [&str; 6] = [
    "EulerAncestralDiscreteScheduler",
    "DDIMScheduler",
    "PNDMScheduler",
    "UniPCMultistepScheduler",
    "LMSDiscreteScheduler",
    "LCMScheduler",
];

impl ScheduleKind {
    /// Resolves a host schedule name. Schedules without a candle implementation
    /// map to the closest one available.
    pub fn from_name(name: &str) -> Self {
        if let Ok(kind) = name.parse::<ScheduleKind>() {
            return kind;
        }
        match name {
            "EulerAncestralDiscreteScheduler" | "EulerDiscreteScheduler" | "LMSDiscreteScheduler" => {
                Self::EulerAncestral
            }
            "UniPCMultistepScheduler" => Self::UniPc,
            "DDIMScheduler" | "PNDMScheduler" | "LCMScheduler"
            | "DDPMScheduler" | "DPMSolverMultistepScheduler" => Self::Ddim,
            other => {
                tracing::warn!(schedule = other, "unknown schedule, using the default");
                Self::default()
            }
        }
    }

    /// Builds a fresh scheduler for `steps` inference steps, with the beta range and
    /// training timesteps of `arch`.
    pub fn build(self, arch: &ArchConfig, steps: usize) -> Result<Box<dyn Scheduler>> {
        let scheduler = match self {
            Self::Ddim => DDIMSchedulerConfig {
                beta_start: arch.linear_start,
                beta_end: arch.linear_end,
                train_timesteps: arch.timesteps,
                ..Default::default()
            }
            .build(steps)?,
            Self::EulerAncestral => EulerAncestralDiscreteSchedulerConfig {
                beta_start: arch.linear_start,
                beta_end: arch.linear_end,
                train_timesteps: arch.timesteps,
                ..Default::default()
            }
            .build(steps)?,
            // UniPC derives its noise levels from a Karras sigma schedule, so only
            // the training length carries over.
            Self::UniPc => UniPCSchedulerConfig {
                num_training_timesteps: arch.timesteps,
                timestep_schedule: TimestepSchedule::Linspace,
                ..Default::default()
            }
            .build(steps)?,
        };
        Ok(scheduler)
    }
}
