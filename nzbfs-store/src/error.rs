use thiserror::Error;

/// Errors of the *Service* kind (§7): NZB assembly and lifecycle.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("nzb already registered: {0}")]
    AlreadyRegistered(String),
    #[error("nzb not found: {0}")]
    NotFound(String),
    #[error("assembly failed for {file}: {reason}")]
    AssemblyFailed { file: String, reason: String },
    #[error("nzb rejected: healthy ratio {ratio:.2} below threshold {threshold:.2}")]
    Unhealthy { ratio: f64, threshold: f64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ServiceError> for std::io::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Io(io) => io,
            ServiceError::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
            ServiceError::AlreadyRegistered(_) => {
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
