use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("read-only filesystem: {0}")]
    ReadOnly(&'static str),
}

impl From<TreeError> for std::io::Error {
    fn from(e: TreeError) -> Self {
        use std::io::ErrorKind;
        let kind = match &e {
            TreeError::NotFound(_) => ErrorKind::NotFound,
            TreeError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            TreeError::ReadOnly(_) => ErrorKind::PermissionDenied,
            TreeError::NotADirectory(_) | TreeError::NotAFile(_) | TreeError::InvalidPath(_) => {
                ErrorKind::InvalidInput
            }
        };
        std::io::Error::new(kind, e.to_string())
    }
}
