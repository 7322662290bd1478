//! Memory-pressure guard.
//!
//! Before a heavy operation the engine measures device occupancy. Under pressure
//! the sub-models not needed by the current request are moved to host memory for
//! the duration of the guard and moved back when it is dropped, whichever way the
//! operation ends.

use candle_core::Device;

use crate::models::{Resident, Shared};
use crate::Result;

/// Reports how full a device's memory is, as a fraction in [0, 1].
pub trait MemoryProbe: Send + Sync {
    /// `None` when the device cannot be measured (the CPU, unsupported backends).
    fn occupancy(&self, device: &Device) -> Option<f32>;
}

/// Asks the driver for free and total memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceProbe;

impl MemoryProbe for DeviceProbe {
    #[cfg(feature = "cuda")]
    fn occupancy(&self, device: &Device) -> Option<f32> {
        use candle_core::cuda_backend::cudarc::driver::result::mem_get_info;

        if !device.is_cuda() {
            return None;
        }
        match mem_get_info() {
            Ok((free, total)) if total > 0 => Some(1.0 - free as f32 / total as f32),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(%err, "cannot query device memory");
                None
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn occupancy(&self, _device: &Device) -> Option<f32> {
        None
    }
}

/// Probe returning a preset value, for hosts that measure memory themselves.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub Option<f32>);

impl MemoryProbe for FixedProbe {
    fn occupancy(&self, _device: &Device) -> Option<f32> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    /// Idle sub-models should leave the device for the next operation.
    Relocate,
    /// Idle sub-models should be dropped altogether.
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressurePolicy {
    pub relocate_above: f32,
    pub evict_above: f32,
}

impl Default for PressurePolicy {
    fn default() -> Self {
        Self {
            relocate_above: 0.80,
            evict_above: 0.95,
        }
    }
}

impl PressurePolicy {
    pub fn assess(&self, occupancy: Option<f32>) -> Pressure {
        match occupancy {
            Some(value) if value > self.evict_above => Pressure::Evict,
            Some(value) if value > self.relocate_above => Pressure::Relocate,
            _ => Pressure::Normal,
        }
    }
}

struct Moved {
    model: Shared<dyn Resident>,
    origin: Device,
}

/// Scoped low-memory headroom. Every sub-model moved by [`PressureGuard::acquire`]
/// goes back to its original device when the guard is released or dropped.
#[must_use = "dropping the guard restores the relocated sub-models immediately"]
pub struct PressureGuard {
    moved: Vec<Moved>,
}

impl std::fmt::Debug for PressureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureGuard").field("moved", &self.moved.len()).finish()
    }
}

impl PressureGuard {
    /// A guard that relocated nothing.
    pub fn idle() -> Self {
        Self { moved: Vec::new() }
    }

    /// Moves `idle` sub-models to the CPU when `pressure` asks for it.
    ///
    /// The acquisition is all or nothing: if one move fails, the models already
    /// moved are put back before the error is returned.
    pub fn acquire(pressure: Pressure, idle: Vec<Shared<dyn Resident>>) -> Result<Self> {
        let mut guard = Self::idle();
        if pressure == Pressure::Normal {
            return Ok(guard);
        }
        for model in idle {
            let origin = model.lock().device();
            model.lock().relocate(&Device::Cpu)?;
            guard.moved.push(Moved { model, origin });
        }
        if !guard.moved.is_empty() {
            tracing::info!(relocated = guard.moved.len(), "moved idle sub-models to host memory");
        }
        Ok(guard)
    }

    pub fn relocated(&self) -> usize {
        self.moved.len()
    }

    /// Restores every relocated sub-model. Returns the first restore error; the
    /// remaining models are still restored.
    pub fn release(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        let mut first_error = None;
        for Moved { model, origin } in self.moved.drain(..).rev() {
            if let Err(err) = model.lock().relocate(&origin) {
                tracing::warn!(%err, ?origin, "failed to restore sub-model");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for PressureGuard {
    fn drop(&mut self) {
        // Errors were logged in restore; there is no caller left to hand them to.
        let _ = self.restore();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::models::shared;
    use crate::Error;

    /// Records every relocation into a shared journal.
    struct FakeModel {
        name: &'static str,
        fail: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Resident for FakeModel {
        fn device(&self) -> Device {
            Device::Cpu
        }

        fn relocate(&mut self, device: &Device) -> Result<()> {
            if self.fail {
                return Err(Error::DeviceOutOfMemory("full".into()));
            }
            self.journal.lock().push(format!("{} -> {:?}", self.name, device.location()));
            Ok(())
        }
    }

    fn model(name: &'static str, fail: bool, journal: &Arc<Mutex<Vec<String>>>) -> Shared<dyn Resident> {
        shared(FakeModel {
            name,
            fail,
            journal: journal.clone(),
        })
    }

    #[test]
    fn thresholds_classify_pressure() {
        let policy = PressurePolicy::default();
        assert_eq!(policy.assess(None), Pressure::Normal);
        assert_eq!(policy.assess(Some(0.5)), Pressure::Normal);
        assert_eq!(policy.assess(Some(0.85)), Pressure::Relocate);
        assert_eq!(policy.assess(Some(0.99)), Pressure::Evict);
    }

    #[test]
    fn normal_pressure_moves_nothing() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let guard = PressureGuard::acquire(Pressure::Normal, vec![model("a", false, &journal)]).unwrap();
        assert_eq!(guard.relocated(), 0);
        drop(guard);
        assert!(journal.lock().is_empty());
    }

    #[test]
    fn drop_restores_every_relocated_model() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let idle = vec![model("a", false, &journal), model("b", false, &journal)];
        let guard = PressureGuard::acquire(Pressure::Relocate, idle).unwrap();
        assert_eq!(guard.relocated(), 2);
        assert_eq!(journal.lock().len(), 2);
        drop(guard);
        assert_eq!(journal.lock().len(), 4);
        assert!(journal.lock()[2].starts_with("b"));
        assert!(journal.lock()[3].starts_with("a"));
    }

    #[test]
    fn failed_acquisition_puts_moved_models_back() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let idle = vec![model("a", false, &journal), model("b", true, &journal)];
        let err = PressureGuard::acquire(Pressure::Relocate, idle).unwrap_err();
        assert!(matches!(err, Error::DeviceOutOfMemory(_)));
        let journal = journal.lock();
        assert_eq!(journal.len(), 2);
        assert!(journal.iter().all(|entry| entry.starts_with("a")));
    }
}
