//! NZB Assembly Service (§4.9): turns one parsed NZB into a tree of
//! presenter-visible files, wiring together every lower layer — per-segment
//! article fetch + cache, the parallel merger, archive decoding, and the
//! read-ahead cache — then registers the result in the shared [`Tree`].

pub mod error;
pub mod grouping;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex as SyncMutex;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{instrument, warn};

use nzbfs_archive::ArchiveResource;
use nzbfs_engine::article::{ArticleFetcher, ArticleResource};
use nzbfs_engine::cache::DiskCache;
use nzbfs_engine::fullcache::FullCacheResource;
use nzbfs_engine::merger::MergerResource;
use nzbfs_engine::readahead::{ReadAheadConfig, ReadAheadResource};
use nzbfs_engine::resource::Resource;
use nzbfs_model::nzb::{NzbData, NzbFile};
use nzbfs_vfs::Tree;

pub use error::ServiceError;
pub use grouping::{ArchiveGroup, DefaultGrouping, GroupingHeuristic};

/// Tunables for the assembly algorithm (§4.9, steps 1, 4-7, and the
/// optional health check).
#[derive(Clone)]
pub struct ServiceConfig {
    /// Dropped before any resource is built (step 1).
    pub file_blacklist: Vec<Regex>,
    /// Dropped from the final path map (step 4).
    pub fs_blacklist: Vec<Regex>,
    /// How many leading path components a lone-entry directory may shed
    /// (step 6).
    pub flatten_max_depth: usize,
    /// Normalized-similarity floor below which a lone-extension basename is
    /// considered obfuscated and eligible for renaming (step 5).
    pub fix_filename_threshold: f64,
    /// Bytes to probe per file during the health check, when
    /// `try_read_pct` is zero.
    pub try_read_bytes: u64,
    /// Fraction of a file's size to probe during the health check; takes
    /// priority over `try_read_bytes` when non-zero.
    pub try_read_pct: f64,
    /// Minimum healthy-file ratio required to keep the NZB.
    pub healthy_threshold: f64,
    /// Whether the health check runs at all; it is opt-in since it forces
    /// at least one article fetch per file before registration.
    pub health_check: bool,
    /// `None` disables read-ahead wrapping entirely.
    pub read_ahead: Option<ReadAheadConfig>,
}

const HEALTH_PROBE_CAP: u64 = 1 << 20;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            file_blacklist: vec![Regex::new(r"(?i)\.(par2|nfo|sfv)$").unwrap()],
            fs_blacklist: Vec::new(),
            flatten_max_depth: 1,
            fix_filename_threshold: 0.2,
            try_read_bytes: 16 * 1024,
            try_read_pct: 0.0,
            healthy_threshold: 1.0,
            health_check: false,
            read_ahead: Some(ReadAheadConfig::default()),
        }
    }
}

/// Owns the shared presentation [`Tree`] and wires freshly parsed NZBs into
/// it. The `registered` map is the "nzb_name → resources and path set"
/// bookkeeping the design calls out as the one piece of state this service
/// mutex protects (§5): everything else (tree, cache) is independently
/// synchronized by its own type.
pub struct Service {
    tree: Arc<Tree>,
    cache: DiskCache,
    fetcher: Arc<dyn ArticleFetcher>,
    grouping: Arc<dyn GroupingHeuristic>,
    config: ServiceConfig,
    registered: SyncMutex<HashMap<String, Vec<String>>>,
}

impl Service {
    pub fn new(
        tree: Arc<Tree>,
        cache: DiskCache,
        fetcher: Arc<dyn ArticleFetcher>,
        config: ServiceConfig,
    ) -> Self {
        Self::with_grouping(tree, cache, fetcher, config, Arc::new(DefaultGrouping::default()))
    }

    pub fn with_grouping(
        tree: Arc<Tree>,
        cache: DiskCache,
        fetcher: Arc<dyn ArticleFetcher>,
        config: ServiceConfig,
        grouping: Arc<dyn GroupingHeuristic>,
    ) -> Self {
        Self {
            tree,
            cache,
            fetcher,
            grouping,
            config,
            registered: SyncMutex::new(HashMap::new()),
        }
    }

    /// Runs the full assembly algorithm and registers the result in the
    /// tree under `/<nzb.name>/...`. Rejects the whole NZB, leaving nothing
    /// registered, if it is already known or (when enabled) fails the
    /// health check.
    #[instrument(skip(self, nzb), fields(nzb = %nzb.name))]
    pub async fn add_nzb(&self, nzb: NzbData) -> Result<(), ServiceError> {
        if self.registered.lock().contains_key(&nzb.name) {
            return Err(ServiceError::AlreadyRegistered(nzb.name));
        }

        // 1. NZB-level filename blacklist.
        let files: Vec<&NzbFile> = nzb
            .files
            .iter()
            .filter(|f| !self.config.file_blacklist.iter().any(|re| re.is_match(&f.filename)))
            .collect();

        // 2. Per-NZB file map: filename -> parallel-merger over per-segment
        // full-cache-over-article resources.
        let mut resources: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        for file in &files {
            let group = file
                .groups
                .iter()
                .find(|g| !g.trim().is_empty())
                .cloned()
                .unwrap_or_default();
            let segments: Vec<Arc<dyn Resource>> = file
                .segments
                .iter()
                .map(|seg| {
                    let article = Arc::new(ArticleResource::new(
                        group.clone(),
                        seg.id.clone(),
                        seg.bytes_hint,
                        self.fetcher.clone(),
                    ));
                    Arc::new(FullCacheResource::new(seg.id.clone(), self.cache.clone(), article))
                        as Arc<dyn Resource>
                })
                .collect();
            resources.insert(file.filename.clone(), Arc::new(MergerResource::new(segments)));
        }

        // 3. Group volumes, decode archives, splice in inner files.
        let filenames: Vec<String> = resources.keys().cloned().collect();
        for group in self.grouping.group(&filenames) {
            let volumes: Vec<Arc<dyn Resource>> = group
                .members
                .iter()
                .filter_map(|m| resources.get(m).cloned())
                .collect();
            if volumes.len() != group.members.len() {
                continue;
            }
            let entries =
                match ArchiveResource::list(group.kind, &volumes, nzb.password.as_deref(), usize::MAX).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(group = %group.key, error = %e, "failed to list archive volumes, keeping raw files");
                        continue;
                    }
                };
            for member in &group.members {
                resources.remove(member);
            }
            for entry in entries {
                let inner = Arc::new(ArchiveResource::new(
                    group.kind,
                    volumes.clone(),
                    entry.name.clone(),
                    nzb.password.clone(),
                ));
                resources.insert(format!("{}/{}", group.key, entry.name), inner);
            }
        }

        // 4. Late filesystem blacklist.
        resources.retain(|path, _| !self.config.fs_blacklist.iter().any(|re| re.is_match(path)));

        // 5. Deobfuscation.
        deobfuscate(&mut resources, &nzb.name, self.config.fix_filename_threshold);

        // 6. Flattening.
        flatten(&mut resources, self.config.flatten_max_depth);

        if self.config.health_check {
            self.health_check(&resources).await?;
        }

        // 7-8. Wrap in read-ahead, insert into the tree.
        let now = SystemTime::now();
        let mut inserted = Vec::with_capacity(resources.len());
        for (path, resource) in resources {
            let resource = match &self.config.read_ahead {
                Some(cfg) if cfg.max_bytes > 1 => {
                    Arc::new(ReadAheadResource::new(resource, cfg.clone())) as Arc<dyn Resource>
                }
                _ => resource,
            };
            let full_path = format!("{}/{}", nzb.name, path);
            match self.tree.add_file(&full_path, now, resource) {
                Ok(()) => inserted.push(full_path),
                Err(e) => warn!(path = %full_path, error = %e, "failed to register file, skipping"),
            }
        }

        self.registered.lock().insert(nzb.name.clone(), inserted);
        Ok(())
    }

    /// Unregisters every path this NZB previously inserted.
    pub fn remove_nzb(&self, name: &str) -> Result<(), ServiceError> {
        let paths = self
            .registered
            .lock()
            .remove(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
        for path in paths {
            if let Err(e) = self.tree.remove_file(&path) {
                warn!(path = %path, error = %e, "failed to unregister path");
            }
        }
        Ok(())
    }

    async fn health_check(&self, resources: &HashMap<String, Arc<dyn Resource>>) -> Result<(), ServiceError> {
        if resources.is_empty() {
            return Ok(());
        }
        let mut healthy = 0usize;
        for (path, resource) in resources {
            match self.probe(resource.as_ref()).await {
                Ok(()) => healthy += 1,
                Err(e) => warn!(path = %path, error = %e, "health probe failed"),
            }
        }
        let ratio = healthy as f64 / resources.len() as f64;
        if ratio < self.config.healthy_threshold {
            return Err(ServiceError::Unhealthy {
                ratio,
                threshold: self.config.healthy_threshold,
            });
        }
        Ok(())
    }

    async fn probe(&self, resource: &dyn Resource) -> std::io::Result<()> {
        let mut reader = resource.open().await?;
        let size = reader.seek(std::io::SeekFrom::End(0)).await?;
        reader.seek(std::io::SeekFrom::Start(0)).await?;

        let want = if self.config.try_read_pct > 0.0 {
            (size as f64 * self.config.try_read_pct) as u64
        } else {
            self.config.try_read_bytes
        };
        let want = want.min(size).min(HEALTH_PROBE_CAP) as usize;
        let mut buf = vec![0u8; want];
        if want > 0 {
            reader.read_exact(&mut buf).await?;
        }
        Ok(())
    }
}

fn dir_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn base_of(path: &str) -> &str {
    path.rfind('/').map(|i| &path[i + 1..]).unwrap_or(path)
}

fn stem_and_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, ""),
    }
}

/// Step 5: within each directory, a file that is the only one holding its
/// extension is a candidate rename target if its stem looks obfuscated
/// (too dissimilar from the NZB name). The replacement prefers the
/// enclosing directory's own name when that is itself close to the NZB
/// name, falling back to the NZB name directly.
fn deobfuscate(paths: &mut HashMap<String, Arc<dyn Resource>>, nzb_name: &str, threshold: f64) {
    let mut ext_counts: HashMap<(String, String), usize> = HashMap::new();
    for path in paths.keys() {
        let (_, ext) = stem_and_ext(base_of(path));
        *ext_counts.entry((dir_of(path).to_string(), ext.to_string())).or_insert(0) += 1;
    }

    let renames: Vec<(String, String)> = paths
        .keys()
        .filter_map(|path| {
            let dir = dir_of(path);
            let (stem, ext) = stem_and_ext(base_of(path));
            if *ext_counts.get(&(dir.to_string(), ext.to_string()))? != 1 {
                return None;
            }
            if ext.is_empty() || strsim::normalized_levenshtein(stem, nzb_name) >= threshold {
                return None;
            }
            let dir_base = base_of(dir);
            let replacement = if !dir_base.is_empty() && strsim::normalized_levenshtein(dir_base, nzb_name) >= threshold
            {
                dir_base.to_string()
            } else {
                nzb_name.to_string()
            };
            let new_path = if dir.is_empty() {
                format!("{replacement}.{ext}")
            } else {
                format!("{dir}/{replacement}.{ext}")
            };
            (new_path != *path).then_some((path.clone(), new_path))
        })
        .collect();

    for (old, new) in renames {
        if paths.contains_key(&new) {
            continue;
        }
        if let Some(resource) = paths.remove(&old) {
            paths.insert(new, resource);
        }
    }
}

/// Step 6: repeatedly strips a single leading path component shared by
/// every remaining entry, up to `max_depth` times. Stops early if any path
/// is exactly that component (nothing left to nest it under).
fn flatten(paths: &mut HashMap<String, Arc<dyn Resource>>, max_depth: usize) {
    for _ in 0..max_depth {
        let mut prefixes = paths.keys().filter_map(|p| p.split('/').next());
        let Some(first) = prefixes.next() else { break };
        if !prefixes.all(|p| p == first) {
            break;
        }
        let prefix = first.to_string();
        if paths.keys().any(|p| p == &prefix) {
            break;
        }
        let renamed: Vec<(String, String)> = paths
            .keys()
            .map(|p| (p.clone(), p[prefix.len() + 1..].to_string()))
            .collect();
        for (old, new) in renamed {
            if let Some(resource) = paths.remove(&old) {
                paths.insert(new, resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nzbfs_engine::resource::Reader;
    use std::io::SeekFrom;
    use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

    struct FakeResource(u64);

    struct FakeReader(u64, u64);

    impl AsyncRead for FakeReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let remaining = this.0.saturating_sub(this.1);
            let n = (buf.remaining() as u64).min(remaining) as usize;
            if n > 0 {
                buf.put_slice(&vec![b'x'; n]);
                this.1 += n as u64;
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl AsyncSeek for FakeReader {
        fn start_seek(self: std::pin::Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            let this = self.get_mut();
            this.1 = match position {
                SeekFrom::Start(n) => n,
                SeekFrom::End(n) => (this.0 as i64 + n) as u64,
                SeekFrom::Current(n) => (this.1 as i64 + n) as u64,
            };
            Ok(())
        }

        fn poll_complete(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<u64>> {
            std::task::Poll::Ready(Ok(self.1))
        }
    }

    #[async_trait::async_trait]
    impl Resource for FakeResource {
        async fn open(&self) -> std::io::Result<Box<dyn Reader>> {
            Ok(Box::new(FakeReader(self.0, 0)))
        }

        fn size(&self) -> u64 {
            self.0
        }
    }

    fn fake(size: u64) -> Arc<dyn Resource> {
        Arc::new(FakeResource(size))
    }

    #[test]
    fn deobfuscate_renames_lone_obfuscated_file() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("xJ8f2q.mkv".to_string(), fake(10));
        deobfuscate(&mut paths, "My Great Movie", 0.2);
        assert!(paths.contains_key("My Great Movie.mkv"));
    }

    #[test]
    fn deobfuscate_leaves_close_enough_name_alone() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("My.Great.Movie.mkv".to_string(), fake(10));
        deobfuscate(&mut paths, "My Great Movie", 0.2);
        assert!(paths.contains_key("My.Great.Movie.mkv"));
    }

    #[test]
    fn deobfuscate_skips_directories_with_multiple_same_extension_files() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("cd1/aaaa.mkv".to_string(), fake(10));
        paths.insert("cd1/bbbb.mkv".to_string(), fake(10));
        deobfuscate(&mut paths, "Movie", 0.2);
        assert!(paths.contains_key("cd1/aaaa.mkv"));
        assert!(paths.contains_key("cd1/bbbb.mkv"));
    }

    #[test]
    fn flatten_strips_single_top_level_directory() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("Release.Name/movie.mkv".to_string(), fake(10));
        paths.insert("Release.Name/sample.mkv".to_string(), fake(10));
        flatten(&mut paths, 1);
        assert!(paths.contains_key("movie.mkv"));
        assert!(paths.contains_key("sample.mkv"));
    }

    #[test]
    fn flatten_stops_at_max_depth() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("a/b/movie.mkv".to_string(), fake(10));
        flatten(&mut paths, 1);
        assert!(paths.contains_key("b/movie.mkv"));
    }

    #[test]
    fn flatten_leaves_multiple_top_level_entries() {
        let mut paths: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        paths.insert("a/one.mkv".to_string(), fake(10));
        paths.insert("b/two.mkv".to_string(), fake(10));
        flatten(&mut paths, 2);
        assert!(paths.contains_key("a/one.mkv"));
        assert!(paths.contains_key("b/two.mkv"));
    }

    #[tokio::test]
    async fn add_nzb_rejects_duplicate_registration() {
        use nzbfs_model::nzb::{NzbData, NzbFile, Segment};

        struct NoopFetcher;
        #[async_trait::async_trait]
        impl ArticleFetcher for NoopFetcher {
            async fn get_article(
                &self,
                _group: &str,
                _id: &str,
            ) -> Result<Box<dyn AsyncRead + Send + Unpin>, nzbfs_engine::error::WireError> {
                Err(nzbfs_engine::error::WireError::Fetch {
                    group: "g".into(),
                    id: "id".into(),
                    reason: "unsupported in test".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1 << 20, nzbfs_engine::cache::EvictMode::Blocking)
            .await
            .unwrap();
        let tree = Arc::new(Tree::new());
        let service = Service::new(tree, cache, Arc::new(NoopFetcher), ServiceConfig::default());

        let nzb = NzbData {
            name: "dup".to_string(),
            password: None,
            files: vec![NzbFile::new(
                "dup.txt",
                "dup.txt",
                vec!["alt.test".to_string()],
                vec![Segment::new("seg1", 1, 100).unwrap()],
                None,
            )
            .unwrap()],
        };

        service.add_nzb(nzb.clone()).await.unwrap();
        let err = service.add_nzb(nzb).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRegistered(_)));
    }
}
