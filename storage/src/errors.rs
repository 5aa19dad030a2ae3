use thiserror::Error;

/// Errors surfaced by the storage drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// The content path is absent. Callers branch on this condition, so it
    /// stays a dedicated variant rather than a message.
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    /// The driver does not support building URLs for the requested method.
    #[error("unsupported url method")]
    UnsupportedMethod,

    /// Everything else, wrapped with operation context.
    #[error("storage error: {0}")]
    StorageError(String),
}

impl Error {
    /// Maps an IPFS client error to a driver error, pinning not-found
    /// conditions to the path being operated on.
    pub fn from_ipfs(path: &str, err: disco_ipfs::Error) -> Self {
        if err.is_not_found() {
            Error::PathNotFound {
                path: path.to_owned(),
            }
        } else {
            Error::StorageError(err.to_string())
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PathNotFound { .. })
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}
