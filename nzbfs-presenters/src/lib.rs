//! Presenters (§4 overview): read-only projections of an
//! [`nzbfs_vfs::Tree`] onto an external protocol. Each presenter only
//! reads the tree; nothing here mutates it.

#[cfg(feature = "fuse")]
pub mod fuse;

#[cfg(feature = "webdav")]
pub mod webdav;

fn to_io_error(e: nzbfs_vfs::TreeError) -> std::io::Error {
    e.into()
}
