use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy)]
pub struct ItemMeta {
    pub size: u64,
    pub mod_time: SystemTime,
}

/// In-memory index of finalized blobs: key -> size/mod-time, plus the
/// running total. Guarded by a single short-held mutex (§5): the whole
/// point is that operations on it never block on I/O.
#[derive(Default)]
pub struct Index {
    items: HashMap<String, ItemMeta>,
    current_size: u64,
}

impl Index {
    pub fn insert(&mut self, key: String, meta: ItemMeta) {
        if let Some(old) = self.items.insert(key, meta) {
            self.current_size -= old.size;
        }
        self.current_size += meta.size;
    }

    pub fn remove(&mut self, key: &str) -> Option<ItemMeta> {
        let meta = self.items.remove(key)?;
        self.current_size -= meta.size;
        Some(meta)
    }

    pub fn get(&self, key: &str) -> Option<ItemMeta> {
        self.items.get(key).copied()
    }

    pub fn touch(&mut self, key: &str, mod_time: SystemTime) {
        if let Some(meta) = self.items.get_mut(key) {
            meta.mod_time = mod_time;
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    /// Least-recently-touched key, i.e. the LRU eviction victim, among the
    /// keys the caller says are eligible (not currently under a read lease).
    pub fn lru_victim(&self, excluding: impl Fn(&str) -> bool) -> Option<String> {
        self.items
            .iter()
            .filter(|(k, _)| !excluding(k))
            .min_by_key(|(_, meta)| meta.mod_time)
            .map(|(k, _)| k.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_track_current_size() {
        let mut idx = Index::default();
        idx.insert(
            "a".into(),
            ItemMeta {
                size: 6,
                mod_time: SystemTime::UNIX_EPOCH,
            },
        );
        idx.insert(
            "b".into(),
            ItemMeta {
                size: 5,
                mod_time: SystemTime::UNIX_EPOCH,
            },
        );
        assert_eq!(idx.current_size(), 11);
        idx.remove("a");
        assert_eq!(idx.current_size(), 5);
    }

    #[test]
    fn lru_victim_picks_oldest_eligible() {
        let mut idx = Index::default();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + std::time::Duration::from_secs(10);
        idx.insert("old".into(), ItemMeta { size: 1, mod_time: t0 });
        idx.insert("new".into(), ItemMeta { size: 1, mod_time: t1 });
        assert_eq!(idx.lru_victim(|_| false), Some("old".to_string()));
        assert_eq!(idx.lru_victim(|k| k == "old"), Some("new".to_string()));
    }
}
