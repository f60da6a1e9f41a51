/// Errors produced by the k3s distribution client.
#[derive(Debug, thiserror::Error)]
pub enum DistError {
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("release catalog error: {0}")]
    Catalog(String),

    #[error("download error: {0}")]
    Download(String),

    #[error("{file} has invalid digest {actual}, expected {expected}")]
    DigestMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("no cached k3s versions available")]
    NoCachedVersions,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

impl DistError {
    /// Whether the error came from the network rather than local state.
    pub fn is_network(&self) -> bool {
        matches!(self, DistError::Http(_) | DistError::Download(_) | DistError::Catalog(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DistError>;
