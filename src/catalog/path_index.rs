use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::client::CatalogClient;

use super::SEP;

/// Memoized mapping from virtual path to remote folder id.
///
/// Entries are inserted once discovered and never removed except by
/// `clear()` on a full refresh. Collection roots are keyed with a trailing
/// separator (`"Music\"`); everything below is keyed bare
/// (`"Music\Beatles"`). The map is behind its own short-held mutex so
/// lookups can interleave remote calls without blocking other readers.
#[derive(Debug, Default)]
pub struct PathIndex {
    map: Mutex<HashMap<String, String>>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: String, folder_id: String) {
        let mut map = self.map.lock().unwrap();
        map.entry(path).or_insert(folder_id);
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.map.lock().unwrap().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.map.lock().unwrap().contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    /// Resolve a virtual path to a folder id, lazily filling in unknown
    /// prefixes by listing the deepest known ancestor. Already-resolved
    /// paths return without any remote traffic.
    ///
    /// Returns `Ok(None)` when a segment has no matching child directory,
    /// when the collection root is unknown, or when the path has no
    /// separator at all.
    pub fn lookup(&self, path: &str, client: &dyn CatalogClient) -> Result<Option<String>> {
        if let Some(id) = self.get(path) {
            return Ok(Some(id));
        }
        if !path.contains(SEP) {
            return Ok(None);
        }

        let segments: Vec<&str> = path.split(SEP).filter(|s| !s.is_empty()).collect();
        let Some((collection, rest)) = segments.split_first() else {
            return Ok(None);
        };

        let root_key = format!("{}{}", collection, SEP);
        let Some(mut current_id) = self.get(&root_key) else {
            return Ok(None);
        };

        let mut prefix = collection.to_string();
        for segment in rest {
            prefix.push(SEP);
            prefix.push_str(segment);

            if let Some(id) = self.get(&prefix) {
                current_id = id;
                continue;
            }

            let children = client.list_directory(&current_id)?;
            match children.iter().find(|c| c.is_dir && c.title == *segment) {
                Some(child) => {
                    tracing::debug!(path = %prefix, id = %child.id, "resolved path segment");
                    self.insert(prefix.clone(), child.id.clone());
                    current_id = child.id.clone();
                }
                None => return Ok(None),
            }
        }
        Ok(Some(current_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ArtistIndex, Child, Collection};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCatalog {
        dirs: HashMap<String, Vec<Child>>,
        directory_calls: AtomicUsize,
    }

    impl StaticCatalog {
        fn new() -> Self {
            let mut dirs = HashMap::new();
            dirs.insert(
                "root".to_string(),
                vec![
                    dir_child("10", "Beatles"),
                    dir_child("11", "Pink Floyd"),
                ],
            );
            dirs.insert("10".to_string(), vec![dir_child("20", "Abbey Road")]);
            dirs.insert("20".to_string(), Vec::new());
            Self {
                dirs,
                directory_calls: AtomicUsize::new(0),
            }
        }
    }

    fn dir_child(id: &str, title: &str) -> Child {
        Child {
            id: id.to_string(),
            title: title.to_string(),
            is_dir: true,
            ..Default::default()
        }
    }

    impl CatalogClient for StaticCatalog {
        fn ping(&self) -> Result<()> {
            Ok(())
        }
        fn list_collections(&self) -> Result<Vec<Collection>> {
            Ok(Vec::new())
        }
        fn list_artist_index(&self, _collection_id: &str) -> Result<ArtistIndex> {
            Ok(ArtistIndex {
                last_modified: 0,
                artists: Vec::new(),
            })
        }
        fn list_directory(&self, folder_id: &str) -> Result<Vec<Child>> {
            self.directory_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.dirs.get(folder_id).cloned().unwrap_or_default())
        }
        fn fetch_cover_art(&self, _file_id: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn fetch_stream(&self, _file_id: &str) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }
    }

    #[test]
    fn test_lookup_walks_segments_lazily() {
        let catalog = StaticCatalog::new();
        let index = PathIndex::new();
        index.insert("Music\\".to_string(), "root".to_string());

        let id = index
            .lookup("Music\\Beatles\\Abbey Road", &catalog)
            .unwrap();
        assert_eq!(id.as_deref(), Some("20"));
        // One listing for "Music" and one for "Beatles".
        assert_eq!(catalog.directory_calls.load(Ordering::SeqCst), 2);
        assert!(index.contains("Music\\Beatles"));
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let catalog = StaticCatalog::new();
        let index = PathIndex::new();
        index.insert("Music\\".to_string(), "root".to_string());

        let first = index.lookup("Music\\Beatles", &catalog).unwrap();
        let calls_after_first = catalog.directory_calls.load(Ordering::SeqCst);
        let second = index.lookup("Music\\Beatles", &catalog).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            catalog.directory_calls.load(Ordering::SeqCst),
            calls_after_first
        );
    }

    #[test]
    fn test_lookup_without_separator_is_malformed() {
        let catalog = StaticCatalog::new();
        let index = PathIndex::new();
        index.insert("Music\\".to_string(), "root".to_string());
        assert!(index.lookup("Music", &catalog).unwrap().is_none());
        assert_eq!(catalog.directory_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lookup_missing_segment_fails_fast() {
        let catalog = StaticCatalog::new();
        let index = PathIndex::new();
        index.insert("Music\\".to_string(), "root".to_string());
        let id = index
            .lookup("Music\\Beatles\\Let It Be\\Nope", &catalog)
            .unwrap();
        assert!(id.is_none());
        // "Music" then "Beatles" listed, then the walk stops.
        assert_eq!(catalog.directory_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_collection_root() {
        let catalog = StaticCatalog::new();
        let index = PathIndex::new();
        assert!(index
            .lookup("Nowhere\\Beatles", &catalog)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_insert_is_first_writer_wins() {
        let index = PathIndex::new();
        index.insert("Music\\Beatles".to_string(), "10".to_string());
        index.insert("Music\\Beatles".to_string(), "999".to_string());
        assert_eq!(index.get("Music\\Beatles").as_deref(), Some("10"));
    }
}
