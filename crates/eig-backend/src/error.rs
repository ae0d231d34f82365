//! Typed errors for engine loading and inference.

use std::path::PathBuf;

/// Errors surfaced by an accelerator runtime implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("engine deserialization failed: {0}")]
    BadEngine(String),

    #[error("device allocation of {bytes} bytes failed")]
    AllocFailed { bytes: usize },

    #[error("execution enqueue rejected")]
    EnqueueRejected,

    #[error("device error: {0}")]
    Device(String),
}

/// Errors while bringing a model up: file read, engine build, buffer
/// and context allocation.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read engine '{path}': {source}")]
    EngineFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("binding '{name}' has an invalid byte length")]
    BindingSize { name: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors from one `infer` call.
#[derive(Debug, thiserror::Error)]
pub enum InferError {
    #[error("host i/o does not match engine bindings: {0}")]
    IoShapeMismatch(String),

    #[error("execution enqueue failed: {0}")]
    EnqueueFailed(#[source] BackendError),

    #[error("device failure during inference: {0}")]
    Backend(#[from] BackendError),
}

impl InferError {
    /// Wire status code for response frames.
    pub const fn status_code(&self) -> u32 {
        match self {
            InferError::IoShapeMismatch(_) => 3,
            InferError::EnqueueFailed(_) | InferError::Backend(_) => 4,
        }
    }
}
