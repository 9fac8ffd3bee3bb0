//! Virtual Filesystem Tree (§4.8): an in-memory tree of directories and
//! files keyed by path, mapping path to [`Openable`]. Read-only to
//! presenters; populated only by the NZB assembly service.
//!
//! Nodes are arena-allocated and addressed by a stable [`NodeId`] (per
//! §9's design note on cyclic/back references), the same shape the
//! teacher uses for its inode table (`castore::fs::InodeTracker`): a
//! single lock guards the arena, and a node's payload (here, the
//! reference-counted [`Openable`]) is independent of arena bookkeeping.

pub mod error;

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

pub use error::TreeError;
use nzbfs_engine::resource::Openable;

type NodeId = usize;
const ROOT: NodeId = 0;

enum Node {
    Dir {
        name: String,
        parent: Option<NodeId>,
        mod_time: SystemTime,
        children: HashMap<String, NodeId>,
    },
    File {
        name: String,
        parent: NodeId,
        mod_time: SystemTime,
        openable: Openable,
    },
}

impl Node {
    fn name(&self) -> &str {
        match self {
            Node::Dir { name, .. } | Node::File { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stat {
    pub size: u64,
    pub mod_time: SystemTime,
    pub is_dir: bool,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub is_dir: bool,
    pub mod_time: SystemTime,
    pub size: u64,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

struct Inner {
    nodes: Vec<Option<Node>>,
}

impl Inner {
    fn new(now: SystemTime) -> Self {
        Self {
            nodes: vec![Some(Node::Dir {
                name: String::new(),
                parent: None,
                mod_time: now,
                children: HashMap::new(),
            })],
        }
    }

    fn children_of(&self, id: NodeId) -> Option<&HashMap<String, NodeId>> {
        match self.nodes.get(id)?.as_ref()? {
            Node::Dir { children, .. } => Some(children),
            Node::File { .. } => None,
        }
    }

    fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut cur = ROOT;
        for part in split(path) {
            cur = *self.children_of(cur)?.get(part)?;
        }
        Some(cur)
    }

    fn add_child(&mut self, parent: NodeId, name: &str, id: NodeId) {
        if let Some(Node::Dir { children, .. }) = self.nodes[parent].as_mut() {
            children.insert(name.to_string(), id);
        }
    }

    fn remove_child(&mut self, parent: NodeId, name: &str) {
        if let Some(Node::Dir { children, .. }) = self.nodes[parent].as_mut() {
            children.remove(name);
        }
    }

    fn ensure_dir_child(
        &mut self,
        parent: NodeId,
        name: &str,
        mod_time: SystemTime,
    ) -> Result<NodeId, TreeError> {
        if let Some(&id) = self.children_of(parent).and_then(|c| c.get(name)) {
            return match self.nodes[id].as_ref().unwrap() {
                Node::Dir { .. } => Ok(id),
                Node::File { .. } => Err(TreeError::NotADirectory(name.to_string())),
            };
        }
        let id = self.nodes.len();
        self.nodes.push(Some(Node::Dir {
            name: name.to_string(),
            parent: Some(parent),
            mod_time,
            children: HashMap::new(),
        }));
        self.add_child(parent, name, id);
        Ok(id)
    }

    /// Climbs from `id` upward, dropping every directory that becomes
    /// empty, stopping at root (root is never removed).
    fn prune_empty_upward(&mut self, mut id: NodeId) {
        loop {
            if id == ROOT {
                return;
            }
            let (parent, empty) = match self.nodes[id].as_ref() {
                Some(Node::Dir { parent, children, .. }) => (*parent, children.is_empty()),
                _ => return,
            };
            if !empty {
                return;
            }
            let name = self.nodes[id].as_ref().unwrap().name().to_string();
            self.nodes[id] = None;
            match parent {
                Some(p) => {
                    self.remove_child(p, &name);
                    id = p;
                }
                None => return,
            }
        }
    }

    fn collect(&self, id: NodeId, recursive: bool, prefix: &str, out: &mut Vec<Entry>) {
        let Some(children) = self.children_of(id) else {
            return;
        };
        let mut names: Vec<&String> = children.keys().collect();
        names.sort();
        for name in names {
            let child_id = children[name];
            match self.nodes[child_id].as_ref().unwrap() {
                Node::Dir { mod_time, .. } => {
                    let path = join(prefix, name);
                    out.push(Entry {
                        path: path.clone(),
                        is_dir: true,
                        mod_time: *mod_time,
                        size: 0,
                    });
                    if recursive {
                        self.collect(child_id, recursive, &path, out);
                    }
                }
                Node::File { mod_time, openable, .. } => {
                    out.push(Entry {
                        path: join(prefix, name),
                        is_dir: false,
                        mod_time: *mod_time,
                        size: openable.size(),
                    });
                }
            }
        }
    }
}

/// A read-only-to-presenters, writer-lockable path tree mapping files to
/// [`Openable`] handles.
pub struct Tree {
    inner: RwLock<Inner>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new(SystemTime::now())),
        }
    }

    /// Creates missing parent directories (carrying `mod_time`), then
    /// inserts the file. Fails on a name collision at any level.
    pub fn add_file(
        &self,
        path: &str,
        mod_time: SystemTime,
        openable: Openable,
    ) -> Result<(), TreeError> {
        let mut inner = self.inner.write().unwrap();
        let parts: Vec<&str> = split(path).collect();
        let (file_name, dir_parts) = parts
            .split_last()
            .ok_or_else(|| TreeError::InvalidPath(path.to_string()))?;

        let mut cur = ROOT;
        for part in dir_parts {
            cur = inner.ensure_dir_child(cur, part, mod_time)?;
        }

        match inner.children_of(cur) {
            Some(children) if children.contains_key(*file_name) => {
                return Err(TreeError::AlreadyExists(path.to_string()));
            }
            None => return Err(TreeError::NotADirectory(path.to_string())),
            _ => {}
        }

        let id = inner.nodes.len();
        inner.nodes.push(Some(Node::File {
            name: (*file_name).to_string(),
            parent: cur,
            mod_time,
            openable,
        }));
        inner.add_child(cur, file_name, id);
        Ok(())
    }

    /// Drops the file and climbs upward removing every directory that
    /// becomes empty, stopping at root.
    pub fn remove_file(&self, path: &str) -> Result<(), TreeError> {
        let mut inner = self.inner.write().unwrap();
        let id = inner
            .resolve(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let parent = match inner.nodes[id].as_ref() {
            Some(Node::File { parent, .. }) => *parent,
            Some(Node::Dir { .. }) => return Err(TreeError::NotAFile(path.to_string())),
            None => return Err(TreeError::NotFound(path.to_string())),
        };
        let name = inner.nodes[id].as_ref().unwrap().name().to_string();
        inner.nodes[id] = None;
        inner.remove_child(parent, &name);
        inner.prune_empty_upward(parent);
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<Openable> {
        let inner = self.inner.read().unwrap();
        let id = inner.resolve(path)?;
        match inner.nodes[id].as_ref()? {
            Node::File { openable, .. } => Some(openable.clone()),
            Node::Dir { .. } => None,
        }
    }

    pub fn stat(&self, path: &str) -> Result<Stat, TreeError> {
        let inner = self.inner.read().unwrap();
        let id = inner
            .resolve(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        Ok(match inner.nodes[id].as_ref().unwrap() {
            Node::Dir { mod_time, .. } => Stat {
                size: 0,
                mod_time: *mod_time,
                is_dir: true,
                mime: "inode/directory".to_string(),
            },
            Node::File { mod_time, openable, name, .. } => Stat {
                size: openable.size(),
                mod_time: *mod_time,
                is_dir: false,
                mime: guess_mime(name),
            },
        })
    }

    pub fn list(&self, path: &str, recursive: bool) -> Result<Vec<Entry>, TreeError> {
        let inner = self.inner.read().unwrap();
        let id = inner
            .resolve(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let mut out = Vec::new();
        inner.collect(id, recursive, "", &mut out);
        Ok(out)
    }

    pub fn mkdir(&self, _path: &str) -> Result<(), TreeError> {
        Err(TreeError::ReadOnly("mkdir"))
    }

    pub fn create(&self, _path: &str) -> Result<(), TreeError> {
        Err(TreeError::ReadOnly("create"))
    }

    pub fn remove_all(&self, _path: &str) -> Result<(), TreeError> {
        Err(TreeError::ReadOnly("remove_all"))
    }

    pub fn copy(&self, _from: &str, _to: &str) -> Result<(), TreeError> {
        Err(TreeError::ReadOnly("copy"))
    }

    pub fn rename(&self, _from: &str, _to: &str) -> Result<(), TreeError> {
        Err(TreeError::ReadOnly("move"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nzbfs_engine::resource::{Reader, Resource};
    use std::io;
    use std::sync::Arc;

    struct FakeResource(u64);

    #[async_trait]
    impl Resource for FakeResource {
        async fn open(&self) -> io::Result<Box<dyn Reader>> {
            unimplemented!("not exercised by tree tests")
        }
        fn size(&self) -> u64 {
            self.0
        }
    }

    fn openable(size: u64) -> Openable {
        Arc::new(FakeResource(size))
    }

    #[test]
    fn add_file_creates_parent_directories() {
        let tree = Tree::new();
        tree.add_file("a/b/c.txt", SystemTime::now(), openable(10)).unwrap();
        assert!(tree.lookup("a/b/c.txt").is_some());
        let stat = tree.stat("a").unwrap();
        assert!(stat.is_dir);
        let stat = tree.stat("a/b").unwrap();
        assert!(stat.is_dir);
    }

    #[test]
    fn add_file_collision_fails() {
        let tree = Tree::new();
        tree.add_file("x.txt", SystemTime::now(), openable(1)).unwrap();
        let err = tree.add_file("x.txt", SystemTime::now(), openable(1)).unwrap_err();
        assert!(matches!(err, TreeError::AlreadyExists(_)));
    }

    #[test]
    fn remove_file_prunes_empty_directories() {
        let tree = Tree::new();
        tree.add_file("a/b/c.txt", SystemTime::now(), openable(1)).unwrap();
        tree.remove_file("a/b/c.txt").unwrap();
        assert!(tree.lookup("a/b/c.txt").is_none());
        assert!(tree.stat("a").is_err());
        assert!(tree.stat("a/b").is_err());
    }

    #[test]
    fn remove_file_keeps_sibling_directories() {
        let tree = Tree::new();
        tree.add_file("a/b/c.txt", SystemTime::now(), openable(1)).unwrap();
        tree.add_file("a/d.txt", SystemTime::now(), openable(1)).unwrap();
        tree.remove_file("a/b/c.txt").unwrap();
        assert!(tree.stat("a").is_ok());
        assert!(tree.stat("a/b").is_err());
        assert!(tree.lookup("a/d.txt").is_some());
    }

    #[test]
    fn list_recursive_returns_all_descendants() {
        let tree = Tree::new();
        tree.add_file("a/b/c.txt", SystemTime::now(), openable(1)).unwrap();
        tree.add_file("a/d.txt", SystemTime::now(), openable(2)).unwrap();
        let entries = tree.list("a", true).unwrap();
        let mut paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["a/b", "a/b/c.txt", "a/d.txt"]);
    }

    #[test]
    fn write_operations_are_rejected() {
        let tree = Tree::new();
        assert!(matches!(tree.mkdir("x").unwrap_err(), TreeError::ReadOnly(_)));
        assert!(matches!(tree.create("x").unwrap_err(), TreeError::ReadOnly(_)));
        assert!(matches!(tree.remove_all("x").unwrap_err(), TreeError::ReadOnly(_)));
        assert!(matches!(tree.copy("x", "y").unwrap_err(), TreeError::ReadOnly(_)));
        assert!(matches!(tree.rename("x", "y").unwrap_err(), TreeError::ReadOnly(_)));
    }

    #[test]
    fn stat_reports_mime_by_extension() {
        let tree = Tree::new();
        tree.add_file("movie.mkv", SystemTime::now(), openable(5)).unwrap();
        let stat = tree.stat("movie.mkv").unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
    }
}
