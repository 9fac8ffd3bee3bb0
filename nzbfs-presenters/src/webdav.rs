//! WebDAV presenter (§4 overview, "presenters" layer): a read-only
//! `dav_server::fs::DavFileSystem` over an [`nzbfs_vfs::Tree`].
//!
//! The teacher has no WebDAV surface of its own; this is learned from
//! `dav-server`'s own filesystem contract, layered the same way the FUSE
//! presenter layers `fuse_backend_rs`: translate DAV paths to tree paths,
//! translate [`nzbfs_vfs::Stat`]/[`nzbfs_vfs::Entry`] to DAV metadata, and
//! bridge reads straight through the opened [`nzbfs_engine::resource::Reader`].

use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, Bytes, BytesMut};
use dav_server::davpath::DavPath;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsResult, FsStream, OpenOptions,
    ReadDirMeta,
};
use futures::stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use nzbfs_engine::resource::Reader;
use nzbfs_vfs::{Entry, Stat, Tree};

fn tree_path(path: &DavPath) -> String {
    path.as_rel_ospath().to_string_lossy().replace('\\', "/")
}

fn map_err(e: nzbfs_vfs::TreeError) -> FsError {
    match e {
        nzbfs_vfs::TreeError::NotFound(_) => FsError::NotFound,
        nzbfs_vfs::TreeError::ReadOnly(_) => FsError::Forbidden,
        _ => FsError::GeneralFailure,
    }
}

#[derive(Debug, Clone)]
struct NzbMetaData {
    size: u64,
    is_dir: bool,
    mod_time: SystemTime,
}

impl From<Stat> for NzbMetaData {
    fn from(s: Stat) -> Self {
        Self {
            size: s.size,
            is_dir: s.is_dir,
            mod_time: s.mod_time,
        }
    }
}

impl From<&Entry> for NzbMetaData {
    fn from(e: &Entry) -> Self {
        Self {
            size: e.size,
            is_dir: e.is_dir,
            mod_time: e.mod_time,
        }
    }
}

impl DavMetaData for NzbMetaData {
    fn len(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.mod_time)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn is_file(&self) -> bool {
        !self.is_dir
    }
}

struct NzbDirEntry {
    name: String,
    meta: NzbMetaData,
}

impl fmt::Debug for NzbDirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NzbDirEntry").field("name", &self.name).finish()
    }
}

impl DavDirEntry for NzbDirEntry {
    fn name(&self) -> Vec<u8> {
        self.name.clone().into_bytes()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = self.meta.clone();
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }
}

/// A read-only open file handle: its bytes come straight from the
/// underlying [`Reader`], there is nothing buffered on top beyond what the
/// reader itself caches.
struct NzbFile {
    reader: Box<dyn Reader>,
    size: u64,
}

impl fmt::Debug for NzbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NzbFile").field("size", &self.size).finish()
    }
}

impl DavFile for NzbFile {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = NzbMetaData {
            size: self.size,
            is_dir: false,
            mod_time: SystemTime::now(),
        };
        Box::pin(async move { Ok(Box::new(meta) as Box<dyn DavMetaData>) })
    }

    fn write_buf(&mut self, _buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        Box::pin(async move { Err(FsError::Forbidden) })
    }

    fn write_bytes(&mut self, _buf: Bytes) -> FsFuture<()> {
        Box::pin(async move { Err(FsError::Forbidden) })
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        Box::pin(async move {
            let mut buf = BytesMut::zeroed(count);
            let n = self
                .reader
                .read(&mut buf)
                .await
                .map_err(|_| FsError::GeneralFailure)?;
            buf.truncate(n);
            Ok(buf.freeze())
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        Box::pin(async move { self.reader.seek(pos).await.map_err(|_| FsError::GeneralFailure) })
    }

    fn flush(&mut self) -> FsFuture<()> {
        Box::pin(async move { Ok(()) })
    }
}

/// Presents an [`nzbfs_vfs::Tree`] over WebDAV. Every write-capable method
/// (`create_dir`, `remove_file`, `rename`, ...) falls back to the trait's
/// default `NotImplemented`/`Forbidden` behavior, matching the tree's own
/// read-only stance toward presenters.
#[derive(Clone)]
pub struct NzbDavFs {
    tree: Arc<Tree>,
}

impl fmt::Debug for NzbDavFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NzbDavFs").finish()
    }
}

impl NzbDavFs {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self { tree }
    }
}

impl DavFileSystem for NzbDavFs {
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<Box<dyn DavFile>> {
        Box::pin(async move {
            if options.write {
                return Err(FsError::Forbidden);
            }
            let rel = tree_path(path);
            let stat = self.tree.stat(&rel).map_err(map_err)?;
            if stat.is_dir {
                return Err(FsError::Forbidden);
            }
            let openable = self.tree.lookup(&rel).ok_or(FsError::NotFound)?;
            let reader = openable.open().await.map_err(|_| FsError::GeneralFailure)?;
            Ok(Box::new(NzbFile { reader, size: stat.size }) as Box<dyn DavFile>)
        })
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath, _meta: ReadDirMeta) -> FsFuture<FsStream<Box<dyn DavDirEntry>>> {
        Box::pin(async move {
            let rel = tree_path(path);
            let entries = self.tree.list(&rel, false).map_err(map_err)?;
            let items: Vec<FsResult<Box<dyn DavDirEntry>>> = entries
                .iter()
                .map(|e| {
                    let name = e.path.rsplit('/').next().unwrap_or(&e.path).to_string();
                    Ok(Box::new(NzbDirEntry { name, meta: e.into() }) as Box<dyn DavDirEntry>)
                })
                .collect();
            Ok(Box::pin(stream::iter(items)) as FsStream<Box<dyn DavDirEntry>>)
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<Box<dyn DavMetaData>> {
        Box::pin(async move {
            let rel = tree_path(path);
            let stat = self.tree.stat(&rel).map_err(map_err)?;
            Ok(Box::new(NzbMetaData::from(stat)) as Box<dyn DavMetaData>)
        })
    }
}
