//! FUSE presenter (§4 overview, "presenters" layer): a read-only
//! `fuse_backend_rs::FileSystem` over an [`nzbfs_vfs::Tree`].
//!
//! Grounded on `castore::fs::TvixStoreFs`: inode bookkeeping under one
//! lock, open files tracked in a handle table, and every blocking-to-async
//! bridge done by spawning onto a captured `tokio::runtime::Handle` and
//! blocking on the join handle (FUSE callbacks are themselves synchronous).

mod daemon;
mod inodes;

pub use daemon::FuseDaemon;

use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_backend_rs::abi::fuse_abi::{stat64, Attr};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyWriter, ROOT_ID,
};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use nzbfs_engine::resource::Reader;
use nzbfs_vfs::Tree;

use inodes::InodeTable;

fn to_secs_nsecs(t: SystemTime) -> (u64, u32) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

fn attr_for(ino: u64, is_dir: bool, size: u64, mod_time: SystemTime) -> Attr {
    let (secs, nsecs) = to_secs_nsecs(mod_time);
    Attr {
        ino,
        size,
        blksize: 1024,
        blocks: size.div_ceil(512),
        mode: (if is_dir {
            libc::S_IFDIR as u32 | 0o555
        } else {
            libc::S_IFREG as u32 | 0o444
        }),
        atime: secs,
        mtime: secs,
        ctime: secs,
        atimensec: nsecs,
        mtimensec: nsecs,
        ctimensec: nsecs,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: secs,
        #[cfg(target_os = "macos")]
        crtimensec: nsecs,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// Presents an [`nzbfs_vfs::Tree`] as a read-only FUSE filesystem. Every
/// inode number above [`ROOT_ID`] is allocated lazily on first lookup or
/// readdir, the same as the teacher's root-nodes-to-inode map.
pub struct NzbFuseFs {
    tree: Arc<Tree>,
    inodes: InodeTable,
    file_handles: RwLock<std::collections::HashMap<u64, Arc<tokio::sync::Mutex<Box<dyn Reader>>>>>,
    next_file_handle: AtomicU64,
    tokio_handle: tokio::runtime::Handle,
}

impl NzbFuseFs {
    pub fn new(tree: Arc<Tree>, tokio_handle: tokio::runtime::Handle) -> Self {
        Self {
            tree,
            inodes: InodeTable::new(),
            file_handles: RwLock::new(std::collections::HashMap::new()),
            next_file_handle: AtomicU64::new(1),
            tokio_handle,
        }
    }

    fn path_of(&self, ino: u64) -> io::Result<String> {
        self.inodes.path_for(ino).ok_or_else(enoent)
    }
}

impl FileSystem for NzbFuseFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let path = self.path_of(inode)?;
        if path.is_empty() {
            return Ok((attr_for(ROOT_ID, true, 0, SystemTime::now()).into(), Duration::MAX));
        }
        let stat = self.tree.stat(&path).map_err(Into::<io::Error>::into)?;
        Ok((attr_for(inode, stat.is_dir, stat.size, stat.mod_time).into(), Duration::MAX))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let child_path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        };
        let stat = self.tree.stat(&child_path).map_err(|_| enoent())?;
        let ino = self.inodes.ino_for(&child_path);
        Ok(Entry {
            inode: ino,
            attr: attr_for(ino, stat.is_dir, stat.size, stat.mod_time).into(),
            attr_timeout: Duration::MAX,
            entry_timeout: Duration::MAX,
            ..Default::default()
        })
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let path = self.path_of(inode)?;
        let entries = self.tree.list(&path, false).map_err(Into::<io::Error>::into)?;

        for (i, entry) in entries.iter().skip(offset as usize).enumerate() {
            let ino = self.inodes.ino_for(&entry.path);
            let name = entry.path.rsplit('/').next().unwrap_or(&entry.path);
            let written = add_entry(DirEntry {
                ino,
                offset: offset + i as u64 + 1,
                type_: if entry.is_dir { libc::S_IFDIR as u32 } else { libc::S_IFREG as u32 },
                name: name.as_bytes(),
            })?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        if inode == ROOT_ID {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }
        let path = self.path_of(inode)?;
        let openable = self.tree.lookup(&path).ok_or_else(enoent)?;

        let task = self.tokio_handle.spawn(async move { openable.open().await });
        let reader = self
            .tokio_handle
            .block_on(task)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
            .map_err(|e| {
                warn!(error = %e, "failed to open resource");
                io::Error::from_raw_os_error(libc::EIO)
            })?;

        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.file_handles.write().insert(fh, Arc::new(tokio::sync::Mutex::new(reader)));
        Ok((Some(fh), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        if self.file_handles.write().remove(&handle).is_none() {
            debug!(fh = handle, "file handle already gone");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let reader = match self.file_handles.read().get(&handle) {
            Some(r) => r.clone(),
            None => return Err(io::Error::from_raw_os_error(libc::EIO)),
        };

        let task = self.tokio_handle.spawn(async move {
            let mut reader = reader.lock().await;
            reader.seek(io::SeekFrom::Start(offset)).await?;
            let mut buf: Vec<u8> = Vec::with_capacity(size as usize);
            tokio::io::copy(&mut reader.as_mut().take(size as u64), &mut buf).await?;
            io::Result::Ok(buf)
        });

        let buf = self
            .tokio_handle
            .block_on(task)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))??;

        w.write(&buf)
    }
}
