//! Progress and cancellation boundary between the core and its host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::DynamicImage;

/// Primitives the host provides. None of them may block on the host side.
pub trait Host: Send + Sync {
    fn report_progress(&self, step: usize, total: usize, preview: Option<&DynamicImage>);

    fn is_canceled(&self) -> bool;

    fn report_status_text(&self, message: &str);
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Host that only logs and listens to a token.
#[derive(Debug, Clone, Default)]
pub struct LogHost {
    token: CancellationToken,
}

impl LogHost {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Host for LogHost {
    fn report_progress(&self, step: usize, total: usize, preview: Option<&DynamicImage>) {
        tracing::debug!(step, total, preview = preview.is_some(), "progress");
    }

    fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    fn report_status_text(&self, message: &str) {
        tracing::info!("{message}");
    }
}
