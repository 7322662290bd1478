use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("unsupported checkpoint format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("unrecognized architecture: {0}")]
    UnrecognizedArchitecture(String),

    #[error("conversion error in {component}: {reason}")]
    Conversion {
        component: &'static str,
        reason: String,
    },

    #[error("adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("adapter {adapter} does not match layer {layer}")]
    AdapterLayerMismatch { adapter: String, layer: String },

    #[error("device out of memory: {0}")]
    DeviceOutOfMemory(String),

    #[error("operation canceled")]
    Canceled,

    #[error("model is not compatible with {mode} generation: {reason}")]
    IncompatibleModelMode { mode: String, reason: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("tensor error: {0}")]
    Tensor(candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker thread is gone")]
    WorkerGone,
}

/// Flat classification of [`Error`] handed to the host with every failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CorruptArchive,
    UnsupportedFormat,
    UnrecognizedArchitecture,
    ConversionError,
    AdapterNotFound,
    AdapterLayerMismatch,
    DeviceOutOfMemory,
    Canceled,
    IncompatibleModelMode,
    ModelNotFound,
    InvalidInput,
    Download,
    Tensor,
    Io,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::UnrecognizedArchitecture(_) => ErrorKind::UnrecognizedArchitecture,
            Error::Conversion { .. } => ErrorKind::ConversionError,
            Error::AdapterNotFound(_) => ErrorKind::AdapterNotFound,
            Error::AdapterLayerMismatch { .. } => ErrorKind::AdapterLayerMismatch,
            Error::DeviceOutOfMemory(_) => ErrorKind::DeviceOutOfMemory,
            Error::Canceled => ErrorKind::Canceled,
            Error::IncompatibleModelMode { .. } => ErrorKind::IncompatibleModelMode,
            Error::ModelNotFound(_) => ErrorKind::ModelNotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Download(_) => ErrorKind::Download,
            Error::Tensor(_) => ErrorKind::Tensor,
            Error::Io(_) => ErrorKind::Io,
            Error::WorkerGone => ErrorKind::Internal,
        }
    }

    pub(crate) fn conversion(component: &'static str, reason: impl Into<String>) -> Self {
        Error::Conversion {
            component,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("out of memory") || lowered.contains("out_of_memory") {
            Error::DeviceOutOfMemory(message)
        } else {
            Error::Tensor(err)
        }
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        Error::Download(err.to_string())
    }
}
