use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dexpert_core::{CancellationToken, Host};
use image::DynamicImage;
use parking_lot::Mutex;
use serde::Serialize;

/// Progress of the one generation the server runs at a time.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    busy: AtomicBool,
    step: AtomicUsize,
    total: AtomicUsize,
    status: Mutex<String>,
    token: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub busy: bool,
    pub step: usize,
    pub total: usize,
    pub status: String,
}

/// Marks the board busy until dropped.
pub struct Busy(Arc<ProgressBoard>);

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

impl ProgressBoard {
    /// Claims the board for a new generation, or `None` if one is running.
    pub fn begin(self: &Arc<Self>) -> Option<Busy> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.token.reset();
        self.step.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.status.lock().clear();
        Some(Busy(Arc::clone(self)))
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            busy: self.is_busy(),
            step: self.step.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            status: self.status.lock().clone(),
        }
    }
}

impl Host for ProgressBoard {
    fn report_progress(&self, step: usize, total: usize, _preview: Option<&DynamicImage>) {
        self.step.store(step, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    fn report_status_text(&self, message: &str) {
        tracing::info!("{message}");
        *self.status.lock() = message.to_string();
    }
}
