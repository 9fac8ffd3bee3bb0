use thiserror::Error;

/// Errors of the *Stream* kind (§7): problems encountered while reading or
/// seeking an already-open [`crate::resource::Reader`].
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid seek to {offset} (size {size:?})")]
    InvalidSeek { offset: i64, size: Option<u64> },
    #[error("unexpected end of stream: wanted {wanted} more bytes, got {got}")]
    UnexpectedEof { wanted: u64, got: u64 },
    #[error("no progress: {0} consecutive empty non-error reads")]
    NoProgress(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string()),
        }
    }
}

/// Errors of the *Wire* kind (§7): talking to Usenet.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("article fetch failed for {group}/{id}: {reason}")]
    Fetch {
        group: String,
        id: String,
        reason: String,
    },
    #[error("yenc decode failed: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WireError> for std::io::Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Errors of the *Cache* kind (§7): the disk-backed segment store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache options: {0}")]
    InvalidOptions(String),
    #[error("could not make space for {needed} bytes (budget {max})")]
    CouldNotMakeSpace { needed: u64, max: u64 },
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CacheError> for std::io::Error {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Io(io) => io,
            CacheError::ItemNotFound(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}
