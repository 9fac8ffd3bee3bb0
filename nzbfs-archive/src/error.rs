use thiserror::Error;

/// Errors of the *Composition* kind (§7): assembling a readable stream out
/// of an archive's inner member.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("file not found in archive: {0}")]
    FileNotFound(String),
    #[error("archive decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CompositionError> for std::io::Error {
    fn from(e: CompositionError) -> Self {
        match e {
            CompositionError::Io(io) => io,
            CompositionError::FileNotFound(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
