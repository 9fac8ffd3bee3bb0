//! The uniform contract every streamable entity in this crate implements.
//!
//! Mirrors the shape of a `BlobService`/`BlobReader` pair, generalized from
//! "one content-addressed blob" to "one logical virtual file", which may be
//! backed by a single article, a cached segment, a merge of many parts, or
//! an archive's inner file.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncSeek};

/// A fresh, independent reader over a [`Resource`]'s bytes.
///
/// Implementors must support [`tokio::io::AsyncSeekExt::seek`] with
/// `SeekFrom::Start`, `Current`, and `End`, returning `InvalidInput` when
/// the result would be negative or (for size-accurate resources) beyond
/// the end.
pub trait Reader: AsyncRead + AsyncSeek + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin + 'static> Reader for T {}

/// Something that can be opened for reading any number of times,
/// independently, and that can report its size.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn Reader>>;

    /// Best-known size in bytes. See [`Resource::is_size_accurate`].
    fn size(&self) -> u64;

    /// Whether `size()` equals the exact number of bytes a full read would
    /// yield. Defaults to `true`; resources that start out with only a
    /// hint (e.g. [`crate::article::ArticleResource`]) override this.
    fn is_size_accurate(&self) -> bool {
        true
    }
}

/// A boxed, object-safe resource handle — this is the `Openable` referred
/// to throughout the design: a reference-counted, thread-safe handle that
/// the virtual filesystem tree stores one of per file.
pub type Openable = std::sync::Arc<dyn Resource>;

/// Turns a seek target for `SeekFrom::{Start,Current,End}` into an absolute
/// offset, validating it against a known size when the whence needs one.
/// Shared by every hand-written `AsyncSeek` impl in this crate so the
/// "invalid seek" rule (§4.1) is enforced identically everywhere.
pub fn resolve_seek(
    whence: io::SeekFrom,
    current: u64,
    size: Option<u64>,
) -> io::Result<u64> {
    let target: i128 = match whence {
        io::SeekFrom::Start(off) => off as i128,
        io::SeekFrom::Current(delta) => current as i128 + delta as i128,
        io::SeekFrom::End(delta) => {
            let size = size.ok_or_else(|| invalid_seek(whence, None))?;
            size as i128 + delta as i128
        }
    };
    if target < 0 {
        return Err(invalid_seek(whence, size));
    }
    if let Some(size) = size {
        if target > size as i128 {
            return Err(invalid_seek(whence, Some(size)));
        }
    }
    Ok(target as u64)
}

fn invalid_seek(whence: io::SeekFrom, size: Option<u64>) -> io::Error {
    crate::error::StreamError::InvalidSeek {
        offset: match whence {
            io::SeekFrom::Start(o) => o as i64,
            io::SeekFrom::Current(o) => o,
            io::SeekFrom::End(o) => o,
        },
        size,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_start_within_bounds() {
        assert_eq!(resolve_seek(io::SeekFrom::Start(5), 0, Some(10)).unwrap(), 5);
    }

    #[test]
    fn seek_start_beyond_accurate_size_fails() {
        assert!(resolve_seek(io::SeekFrom::Start(11), 0, Some(10)).is_err());
    }

    #[test]
    fn seek_to_exact_size_allowed() {
        assert_eq!(resolve_seek(io::SeekFrom::Start(10), 0, Some(10)).unwrap(), 10);
    }

    #[test]
    fn seek_current_negative_past_zero_fails() {
        assert!(resolve_seek(io::SeekFrom::Current(-1), 0, Some(10)).is_err());
    }

    #[test]
    fn seek_end_without_known_size_fails() {
        assert!(resolve_seek(io::SeekFrom::End(0), 0, None).is_err());
    }

    #[test]
    fn seek_end_negative_offset() {
        assert_eq!(resolve_seek(io::SeekFrom::End(-5), 0, Some(10)).unwrap(), 5);
    }
}
