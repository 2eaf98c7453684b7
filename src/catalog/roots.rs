use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::client::{CatalogClient, Collection};

use super::{PathIndex, SEP};

/// Result of a root enumeration pass.
#[derive(Debug, Default)]
pub struct RootsOutcome {
    pub roots: Vec<Collection>,
    /// True when at least one collection's server watermark moved past the
    /// stored one during this pass.
    pub dirty: bool,
}

/// Walks the server's top-level collections and their artist indexes,
/// seeding the path index and tracking per-collection modification
/// watermarks. Borrows the state it mutates; the service owns it.
pub struct CollectionEnumerator<'a> {
    client: &'a dyn CatalogClient,
    index: &'a PathIndex,
    watermarks: &'a Mutex<HashMap<String, u64>>,
}

impl<'a> CollectionEnumerator<'a> {
    pub fn new(
        client: &'a dyn CatalogClient,
        index: &'a PathIndex,
        watermarks: &'a Mutex<HashMap<String, u64>>,
    ) -> Self {
        Self {
            client,
            index,
            watermarks,
        }
    }

    /// Enumerate top-level collections and (unless `collections_only`) their
    /// artist indexes into the path index.
    ///
    /// Enumeration is a one-time bootstrap: with `refresh` unset and a
    /// populated index this is a no-op. `Ok(None)` means `dirty_only` was
    /// requested and no collection watermark moved, so the caller can skip
    /// re-caching entirely; that is distinct from an empty outcome.
    pub fn enumerate_roots(
        &self,
        collections_only: bool,
        refresh: bool,
        dirty_only: bool,
    ) -> Result<Option<RootsOutcome>> {
        if !refresh && !self.index.is_empty() {
            return Ok(Some(RootsOutcome::default()));
        }

        let roots = self.client.list_collections()?;
        tracing::info!(count = roots.len(), "enumerating collections");
        for collection in &roots {
            self.index
                .insert(format!("{}{}", collection.name, SEP), collection.id.clone());
        }

        let mut dirty = false;
        if !collections_only {
            for collection in &roots {
                let (_, collection_dirty) =
                    self.enumerate_artists(&collection.id, &collection.name, true)?;
                dirty |= collection_dirty;
            }
        }

        if dirty_only && !dirty {
            return Ok(None);
        }
        Ok(Some(RootsOutcome { roots, dirty }))
    }

    /// Fetch one collection's artist index and record every artist under
    /// `<collection>\<artist>`. Returns `(artist id, collection name)` pairs
    /// and whether the collection is dirty (always false when `track_dirty`
    /// is unset).
    pub fn enumerate_artists(
        &self,
        collection_id: &str,
        collection_name: &str,
        track_dirty: bool,
    ) -> Result<(Vec<(String, String)>, bool)> {
        let artist_index = self.client.list_artist_index(collection_id)?;
        let dirty = if track_dirty {
            self.advance_watermark(collection_name, artist_index.last_modified)
        } else {
            false
        };

        let mut entries = Vec::with_capacity(artist_index.artists.len());
        for artist in &artist_index.artists {
            self.index.insert(
                format!("{}{}{}", collection_name, SEP, artist.name),
                artist.id.clone(),
            );
            entries.push((artist.id.clone(), collection_name.to_string()));
        }
        Ok((entries, dirty))
    }

    /// Compare the server watermark against the stored one and advance the
    /// stored value. Dirty when the stored value is absent or the server
    /// value is strictly greater; the store advances even when the caller
    /// defers re-enumeration.
    fn advance_watermark(&self, collection_name: &str, server_value: u64) -> bool {
        let mut watermarks = self.watermarks.lock().unwrap();
        let dirty = match watermarks.get(collection_name) {
            None => true,
            Some(&stored) => server_value > stored,
        };
        if dirty {
            tracing::debug!(collection = collection_name, server_value, "collection dirty");
        }
        watermarks.insert(collection_name.to_string(), server_value);
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ArtistEntry, ArtistIndex, Child};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TwoRootCatalog {
        watermark: u64,
        collection_calls: AtomicUsize,
    }

    impl CatalogClient for TwoRootCatalog {
        fn ping(&self) -> Result<()> {
            Ok(())
        }
        fn list_collections(&self) -> Result<Vec<Collection>> {
            self.collection_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                Collection {
                    id: "1".to_string(),
                    name: "Music".to_string(),
                },
                Collection {
                    id: "2".to_string(),
                    name: "Bootlegs".to_string(),
                },
            ])
        }
        fn list_artist_index(&self, collection_id: &str) -> Result<ArtistIndex> {
            let artists = if collection_id == "1" {
                vec![
                    ArtistEntry {
                        id: "10".to_string(),
                        name: "Beatles".to_string(),
                    },
                    ArtistEntry {
                        id: "11".to_string(),
                        name: "Can".to_string(),
                    },
                ]
            } else {
                Vec::new()
            };
            Ok(ArtistIndex {
                last_modified: self.watermark,
                artists,
            })
        }
        fn list_directory(&self, _folder_id: &str) -> Result<Vec<Child>> {
            Ok(Vec::new())
        }
        fn fetch_cover_art(&self, _file_id: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn fetch_stream(&self, _file_id: &str) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(std::io::empty()))
        }
    }

    fn catalog(watermark: u64) -> TwoRootCatalog {
        TwoRootCatalog {
            watermark,
            collection_calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_bootstrap_populates_index() {
        let client = catalog(5);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::new());
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        let outcome = enumerator.enumerate_roots(false, false, false).unwrap().unwrap();
        assert_eq!(outcome.roots.len(), 2);
        // First sight of every collection is dirty.
        assert!(outcome.dirty);
        assert_eq!(index.get("Music\\").as_deref(), Some("1"));
        assert_eq!(index.get("Bootlegs\\").as_deref(), Some("2"));
        assert_eq!(index.get("Music\\Beatles").as_deref(), Some("10"));
        assert_eq!(index.get("Music\\Can").as_deref(), Some("11"));
    }

    #[test]
    fn test_second_pass_short_circuits() {
        let client = catalog(5);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::new());
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        enumerator.enumerate_roots(false, false, false).unwrap();
        let second = enumerator.enumerate_roots(false, false, false).unwrap().unwrap();
        assert!(second.roots.is_empty());
        assert!(!second.dirty);
        assert_eq!(client.collection_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_equal_watermark_is_clean() {
        let client = catalog(5);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::from([
            ("Music".to_string(), 5u64),
            ("Bootlegs".to_string(), 5u64),
        ]));
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        let outcome = enumerator.enumerate_roots(false, true, false).unwrap().unwrap();
        assert!(!outcome.dirty);
    }

    #[test]
    fn test_greater_watermark_flags_dirty_and_advances() {
        let client = catalog(6);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::from([
            ("Music".to_string(), 5u64),
            ("Bootlegs".to_string(), 6u64),
        ]));
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        let outcome = enumerator.enumerate_roots(false, true, false).unwrap().unwrap();
        assert!(outcome.dirty);
        assert_eq!(watermarks.lock().unwrap()["Music"], 6);
    }

    #[test]
    fn test_dirty_only_signals_no_work() {
        let client = catalog(5);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::from([
            ("Music".to_string(), 5u64),
            ("Bootlegs".to_string(), 5u64),
        ]));
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        assert!(enumerator.enumerate_roots(false, true, true).unwrap().is_none());
    }

    #[test]
    fn test_collections_only_skips_artist_pass() {
        let client = catalog(9);
        let index = PathIndex::new();
        let watermarks = Mutex::new(HashMap::new());
        let enumerator = CollectionEnumerator::new(&client, &index, &watermarks);

        let outcome = enumerator.enumerate_roots(true, true, false).unwrap().unwrap();
        assert_eq!(outcome.roots.len(), 2);
        assert!(!outcome.dirty);
        assert!(index.get("Music\\Beatles").is_none());
        assert!(watermarks.lock().unwrap().is_empty());
    }
}
