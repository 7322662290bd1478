//! The single background thread used for long blocking calls (checkpoint reads,
//! hub downloads). The caller stays on its own thread and polls the host for
//! cancellation while the job runs.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{Error, Host, Result};

type Job = Box<dyn FnOnce() + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Worker {
    jobs: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn() -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("dexpert-io".to_string())
            .spawn(move || {
                while let Ok(job) = queue.recv() {
                    job();
                }
            })?;
        Ok(Self {
            jobs: Some(jobs),
            handle: Some(handle),
        })
    }

    /// Runs `job` on the worker and waits for it. When the host cancels first the
    /// call returns [`Error::Canceled`]; the job still finishes in the background and
    /// its result is dropped.
    pub fn run<T, F>(&self, host: &dyn Host, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (done, result) = mpsc::channel();
        let jobs = self.jobs.as_ref().ok_or(Error::WorkerGone)?;
        jobs.send(Box::new(move || {
            // The receiver is gone when the caller canceled.
            let _ = done.send(job());
        }))
        .map_err(|_| Error::WorkerGone)?;

        loop {
            if host.is_canceled() {
                return Err(Error::Canceled);
            }
            match result.recv_timeout(POLL_INTERVAL) {
                Ok(value) => return value,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::WorkerGone),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("io worker panicked");
            }
        }
    }
}
