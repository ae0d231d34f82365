//! Server-side error types.

use std::net::SocketAddr;

use eig_backend::LoadError;

/// Model resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown model id: {0}")]
    UnknownModel(String),

    #[error("loading model '{id}' failed: {source}")]
    Load {
        id: String,
        #[source]
        source: LoadError,
    },
}

impl ManagerError {
    /// Wire status code for response frames.
    pub const fn status_code(&self) -> u32 {
        match self {
            ManagerError::UnknownModel(_) => 2,
            ManagerError::Load { .. } => 4,
        }
    }
}

/// Fatal server bring-up failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("listen failed: {0}")]
    Listen(#[source] std::io::Error),
}
