//! Error types for the extension manager

use thiserror::Error;

/// Main error type for EiriniX operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timed out after {0}")]
    Timeout(String),

    #[error("Admission server error: {0}")]
    ServerError(String),

    /// Registries are frozen once the manager is running
    #[error("Manager is already running, handlers must be added before start")]
    AlreadyRunning,
}

/// Result type alias for EiriniX operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build an API error the way the API server reports one
    pub fn api(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} ({code})"),
            reason,
            code,
        }))
    }

    /// HTTP status code carried by a Kubernetes API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// The requested object does not exist
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// The object already exists or was modified concurrently
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// The requested resource version is no longer available
    pub fn is_gone(&self) -> bool {
        self.api_code() == Some(410)
    }

    /// Authentication or authorization was refused by the API server
    pub fn is_forbidden(&self) -> bool {
        matches!(self.api_code(), Some(401) | Some(403))
    }
}
