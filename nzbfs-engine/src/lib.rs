//! Resource Composition and Streaming Engine: the seekable byte-stream
//! abstraction ([`resource::Resource`] / [`resource::Reader`]) and the
//! pipeline that glues article fetch, full-segment cache, the adaptive
//! parallel merger, and the adaptive read-ahead cache into one contract per
//! virtual file.

pub mod article;
pub mod cache;
pub mod error;
pub mod fullcache;
pub mod merger;
pub mod readahead;
pub mod resource;
pub mod ringbuffer;

pub use error::{CacheError, StreamError, WireError};
pub use resource::{Openable, Reader, Resource};
