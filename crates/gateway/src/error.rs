//! Gateway error types.

use provis_directory::DirectoryError;
use provis_store::StoreError;

/// Gateway error type.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key backend error: {0}")]
    KeyBackend(String),

    #[error("datacenter discovery failed: {0}")]
    Discovery(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("core error: {0}")]
    Core(#[from] provis_core::Error),
}

impl GatewayError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::KeyBackend(_) => "key_backend_error",
            Self::Discovery(_) => "discovery_error",
            Self::Internal(_) => "internal_error",
            Self::Directory(DirectoryError::NotFound(_)) => "not_found",
            Self::Directory(_) => "directory_error",
            Self::Store(_) => "store_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Whether the caller supplied something wrong, as opposed to a failure
    /// on the gateway's side.
    pub fn is_client_error(&self) -> bool {
        matches!(self.code(), "bad_request" | "not_found")
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
