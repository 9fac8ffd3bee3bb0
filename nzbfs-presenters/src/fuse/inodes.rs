//! Path <-> inode allocation for the FUSE presenter.
//!
//! [`nzbfs_vfs::Tree`] addresses everything by path, but FUSE addresses
//! everything by a stable numeric inode. This is the same shape as the
//! teacher's `castore::fs::InodeTracker`: one lock over a bidirectional
//! map, inodes handed out once and never reused or recycled.

use std::collections::HashMap;
use std::sync::RwLock;

use fuse_backend_rs::api::filesystem::ROOT_ID;

#[derive(Default)]
struct Inner {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

pub struct InodeTable(RwLock<Inner>);

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        Self(RwLock::new(Inner {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
            next_ino: ROOT_ID + 1,
        }))
    }

    /// Returns the inode for `path`, allocating a fresh one on first sight.
    /// `path` is the tree path with no leading slash; the root is `""`.
    pub fn ino_for(&self, path: &str) -> u64 {
        if path.is_empty() {
            return ROOT_ID;
        }
        if let Some(ino) = self.0.read().unwrap().path_to_ino.get(path) {
            return *ino;
        }
        let mut inner = self.0.write().unwrap();
        if let Some(ino) = inner.path_to_ino.get(path) {
            return *ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.path_to_ino.insert(path.to_string(), ino);
        inner.ino_to_path.insert(ino, path.to_string());
        ino
    }

    pub fn path_for(&self, ino: u64) -> Option<String> {
        if ino == ROOT_ID {
            return Some(String::new());
        }
        self.0.read().unwrap().ino_to_path.get(&ino).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_always_root_id() {
        let t = InodeTable::new();
        assert_eq!(t.ino_for(""), ROOT_ID);
        assert_eq!(t.path_for(ROOT_ID), Some(String::new()));
    }

    #[test]
    fn same_path_gets_same_inode() {
        let t = InodeTable::new();
        let a = t.ino_for("movie/file.mkv");
        let b = t.ino_for("movie/file.mkv");
        assert_eq!(a, b);
        assert_eq!(t.path_for(a).as_deref(), Some("movie/file.mkv"));
    }

    #[test]
    fn distinct_paths_get_distinct_inodes() {
        let t = InodeTable::new();
        assert_ne!(t.ino_for("a"), t.ino_for("b"));
    }
}
