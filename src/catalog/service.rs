use anyhow::Result;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::client::{CatalogClient, Child, Collection, SubsonicClient};
use crate::config::ServerConfig;

use super::cache::{self, CacheLoad, FileRecordCache};
use super::roots::CollectionEnumerator;
use super::tags::{project, TagRecord};
use super::{first_segment, parent_of, to_virtual, PathIndex, SEP};

/// Failure taxonomy exposed to callers. Listing operations degrade to empty
/// results instead; only `fetch_stream` surfaces these directly, because an
/// empty stream and a missing file must stay distinguishable.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no remote file found for {0}")]
    NotFound(String),
    #[error("remote catalog unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("persisted catalog cache is corrupt")]
    CacheCorrupt,
}

/// Handle on a background cache rebuild. Dropping it detaches the task.
pub struct RefreshHandle {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    /// Ask the rebuild to stop at the next folder boundary. A cancelled
    /// rebuild publishes nothing; the previous cache generation stays live.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// The façade over the whole projection layer: path resolution, collection
/// enumeration, the flattened record cache, and the raw fetch operations.
///
/// All state is owned here and shared by reference; there are no globals.
/// Every public operation is blocking and never propagates a raw remote
/// failure: it returns what it can and records the failure in the
/// last-error slot.
pub struct DirectoryService {
    client: Box<dyn CatalogClient>,
    cache: FileRecordCache,
    index: PathIndex,
    collections: Mutex<Vec<Collection>>,
    watermarks: Mutex<HashMap<String, u64>>,
    /// Current cache generation. Swapped wholesale on refresh; readers that
    /// cloned the Arc keep a consistent (if stale) view.
    records: RwLock<Option<Arc<Vec<TagRecord>>>>,
    last_error: Mutex<Option<String>>,
}

impl DirectoryService {
    pub fn new(client: Box<dyn CatalogClient>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache: FileRecordCache::new(cache_path),
            index: PathIndex::new(),
            collections: Mutex::new(Vec::new()),
            watermarks: Mutex::new(HashMap::new()),
            records: RwLock::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let client = SubsonicClient::new(config)?;
        Ok(Self::new(Box::new(client), config.cache_file.clone()))
    }

    /// Load the persisted record cache into memory. Corrupt or missing
    /// blobs mean a cold start, never a failure.
    pub fn load_cache(&self) -> bool {
        match self.cache.load() {
            CacheLoad::Loaded {
                records,
                watermarks,
            } => {
                *self.watermarks.lock().unwrap() = watermarks;
                *self.records.write().unwrap() = Some(Arc::new(records));
                true
            }
            CacheLoad::Empty => false,
            CacheLoad::Corrupt => {
                *self.last_error.lock().unwrap() = Some(CatalogError::CacheCorrupt.to_string());
                false
            }
        }
    }

    /// Most recent degraded-operation failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn cached_records(&self) -> Option<Arc<Vec<TagRecord>>> {
        self.records.read().unwrap().clone()
    }

    pub fn ping(&self) -> Result<()> {
        self.client.ping()
    }

    // --- listing ---

    /// Immediate sub-folders of a virtual path. Empty path lists the
    /// collection names; unknown paths list as empty.
    pub fn list_folders(&self, path: &str) -> Vec<String> {
        let result = self.list_folders_inner(path);
        self.guard(result, Vec::new())
    }

    fn list_folders_inner(&self, path: &str) -> Result<Vec<String>> {
        self.bootstrap()?;
        if path.is_empty() {
            let collections = self.collections.lock().unwrap();
            return Ok(collections.iter().map(|c| c.name.clone()).collect());
        }
        let Some(folder_id) = self.resolve_folder_id(path)? else {
            return Ok(Vec::new());
        };
        let children = self.client.list_directory(&folder_id)?;
        let mut names = Vec::new();
        for child in children {
            if child.is_dir {
                self.index
                    .insert(format!("{}{}{}", path, SEP, child.title), child.id.clone());
                names.push(child.title);
            }
        }
        Ok(names)
    }

    /// All songs under a virtual path. With a loaded cache and a non-empty
    /// path this filters the flattened records by prefix and sorts them
    /// case-insensitively; otherwise it walks the remote tree and returns
    /// the files in discovery order.
    pub fn list_files(&self, path: &str) -> Vec<TagRecord> {
        if !path.is_empty() {
            if let Some(records) = self.cached_records() {
                let prefix = format!("{}{}", path, SEP);
                let mut hits: Vec<TagRecord> = records
                    .iter()
                    .filter(|r| r.path().starts_with(&prefix))
                    .cloned()
                    .collect();
                hits.sort_by_cached_key(|r| r.path().to_lowercase());
                return hits;
            }
        }
        let result = self.walk_files(path);
        self.guard(result, Vec::new())
    }

    fn walk_files(&self, path: &str) -> Result<Vec<TagRecord>> {
        self.bootstrap()?;
        let mut out = Vec::new();
        if path.is_empty() {
            let collections = self.collections.lock().unwrap().clone();
            for collection in collections {
                let root_key = format!("{}{}", collection.name, SEP);
                if let Some(id) = self.index.get(&root_key) {
                    self.walk_folder(&id, &collection.name, &mut out, None)?;
                }
            }
        } else if let Some(id) = self.resolve_folder_id(path)? {
            let base = first_segment(path).to_string();
            self.walk_folder(&id, &base, &mut out, None)?;
        }
        Ok(out)
    }

    fn walk_folder(
        &self,
        folder_id: &str,
        base: &str,
        out: &mut Vec<TagRecord>,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
            return Ok(());
        }
        let children = self.client.list_directory(folder_id)?;
        for child in children {
            if child.is_dir {
                self.index.insert(
                    format!("{}{}{}", base, SEP, to_virtual(&child.path)),
                    child.id.clone(),
                );
                self.walk_folder(&child.id, base, out, cancel)?;
            } else if let Some(record) = project(&child, Some(base)) {
                out.push(record);
            }
        }
        Ok(())
    }

    // --- single-file operations ---

    /// Resolve one virtual path to its tag record via its parent directory.
    pub fn resolve_file(&self, path: &str) -> Option<TagRecord> {
        let result = self.resolve_child(path);
        match self.guard(result, None) {
            Some((qualified, child)) => project(&child, Some(first_segment(&qualified))),
            None => None,
        }
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.resolve_file(path).is_some()
    }

    pub fn fetch_artwork(&self, path: &str) -> Option<Vec<u8>> {
        let resolved = self.resolve_child(path);
        let (_, child) = self.guard(resolved, None)?;
        let cover_id = child.cover_art?;
        let art = self.client.fetch_cover_art(&cover_id);
        self.guard(art.map(Some), None)
    }

    /// Open the raw audio stream for a virtual path. Unlike the listing
    /// operations this reports not-found explicitly, so callers can tell a
    /// missing file from an empty stream.
    pub fn fetch_stream(&self, path: &str) -> Result<Box<dyn Read + Send>, CatalogError> {
        match self.resolve_child(path) {
            Err(err) => {
                self.record_error(&err);
                Err(CatalogError::RemoteUnavailable(err.to_string()))
            }
            Ok(None) => Err(CatalogError::NotFound(path.to_string())),
            Ok(Some((_, child))) => self.client.fetch_stream(&child.id).map_err(|err| {
                self.record_error(&err);
                CatalogError::RemoteUnavailable(err.to_string())
            }),
        }
    }

    fn resolve_child(&self, path: &str) -> Result<Option<(String, Child)>> {
        self.bootstrap()?;
        let qualified = self.qualify(path);
        match self.find_child(&qualified)? {
            Some(child) => Ok(Some((qualified, child))),
            None => Ok(None),
        }
    }

    /// Match a fully qualified virtual path against its parent's children.
    fn find_child(&self, qualified: &str) -> Result<Option<Child>> {
        let Some(parent) = parent_of(qualified) else {
            return Ok(None);
        };
        let Some(parent_id) = self.resolve_folder_id(parent)? else {
            return Ok(None);
        };
        let base = first_segment(qualified);
        let children = self.client.list_directory(&parent_id)?;
        for child in children {
            if child.is_dir {
                continue;
            }
            let child_path = format!("{}{}{}", base, SEP, to_virtual(&child.path));
            if child_path == qualified {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    // --- ambiguous path resolution ---

    /// Prefix a collection-relative path with the collection it most likely
    /// belongs to. A single collection needs no probing. With several, the
    /// candidate whose parent directory exists wins; parent-level ties are
    /// broken by probing the file itself (one extra round trip each), and
    /// if nothing resolves, the last candidate that passed the parent scan
    /// is returned best-effort.
    pub fn resolve_virtual_path(&self, relative: &str) -> String {
        let collections = self.collections.lock().unwrap().clone();
        if collections.len() == 1 {
            return format!("{}{}{}", collections[0].name, SEP, relative);
        }

        let mut parent_hits: Vec<String> = Vec::new();
        let mut last_candidate: Option<String> = None;
        for collection in &collections {
            let candidate = format!("{}{}{}", collection.name, SEP, relative);
            last_candidate = Some(candidate.clone());
            let parent_exists = parent_of(&candidate)
                .map(|parent| matches!(self.resolve_folder_id(parent), Ok(Some(_))))
                .unwrap_or(false);
            if parent_exists {
                parent_hits.push(candidate);
            }
        }

        if parent_hits.len() > 1 {
            for candidate in &parent_hits {
                if matches!(self.find_child(candidate), Ok(Some(_))) {
                    return candidate.clone();
                }
            }
            tracing::debug!(relative, "ambiguous path, falling back to last parent match");
        }
        parent_hits
            .pop()
            .or(last_candidate)
            .unwrap_or_else(|| relative.to_string())
    }

    fn qualify(&self, path: &str) -> String {
        let known = {
            let collections = self.collections.lock().unwrap();
            let first = first_segment(path);
            collections.iter().any(|c| c.name == first)
        };
        if known {
            path.to_string()
        } else {
            self.resolve_virtual_path(path)
        }
    }

    // --- refresh ---

    /// Rebuild the full record cache by walking every collection, then
    /// persist and publish the new generation when anything changed.
    /// Returns whether it did.
    pub fn force_refresh(&self) -> bool {
        let result = self.refresh_inner(false, None);
        self.guard(result, false)
    }

    /// Like `force_refresh`, but skips the walk entirely when no collection
    /// watermark moved.
    pub fn refresh_if_dirty(&self) -> bool {
        let result = self.refresh_inner(true, None);
        self.guard(result, false)
    }

    /// Run a refresh on a background thread. Foreground queries keep being
    /// served from the previous cache generation until the swap.
    pub fn refresh_in_background(self: &Arc<Self>, dirty_only: bool) -> RefreshHandle {
        let service = Arc::clone(self);
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancel);
        let handle = thread::spawn(move || {
            let result = service.refresh_inner(dirty_only, Some(cancel_flag.as_ref()));
            match service.guard(result, false) {
                true => tracing::info!("background refresh published a new cache generation"),
                false => tracing::debug!("background refresh left the cache unchanged"),
            }
        });
        RefreshHandle { cancel, handle }
    }

    fn refresh_inner(&self, dirty_only: bool, cancel: Option<&AtomicBool>) -> Result<bool> {
        let enumerator =
            CollectionEnumerator::new(self.client.as_ref(), &self.index, &self.watermarks);
        // Watermark probe runs before the memoized index is touched, and the
        // collection list is refreshed either way: a clean dirty-only pass
        // keeps every resolved path and still serves root listings.
        let outcome = enumerator
            .enumerate_roots(false, true, false)?
            .unwrap_or_default();
        *self.collections.lock().unwrap() = outcome.roots.clone();
        if dirty_only && !outcome.dirty {
            tracing::debug!("no collection dirty, skipping re-cache");
            return Ok(false);
        }

        // Rebuilding: drop every stale mapping now. The walk below re-seeds
        // the index with each directory it discovers.
        self.index.clear();
        let mut fresh = Vec::new();
        for collection in &outcome.roots {
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                tracing::info!("refresh cancelled");
                return Ok(false);
            }
            self.index
                .insert(format!("{}{}", collection.name, SEP), collection.id.clone());
            self.walk_folder(&collection.id, &collection.name, &mut fresh, cancel)?;
        }
        if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
            tracing::info!("refresh cancelled");
            return Ok(false);
        }

        let changed = match self.cached_records() {
            Some(old) => cache::diff(&old, &fresh),
            None => true,
        };
        if changed {
            let watermarks = self.watermarks.lock().unwrap().clone();
            self.cache.persist(&fresh, &watermarks)?;
            *self.records.write().unwrap() = Some(Arc::new(fresh));
        }
        Ok(changed)
    }

    // --- plumbing ---

    fn bootstrap(&self) -> Result<()> {
        let enumerator =
            CollectionEnumerator::new(self.client.as_ref(), &self.index, &self.watermarks);
        if let Some(outcome) = enumerator.enumerate_roots(false, false, false)? {
            if !outcome.roots.is_empty() {
                *self.collections.lock().unwrap() = outcome.roots;
            }
        }
        Ok(())
    }

    /// Folder id for a virtual path. Single-segment paths address a
    /// collection root; anything deeper goes through the lazy index walk.
    fn resolve_folder_id(&self, path: &str) -> Result<Option<String>> {
        if !path.contains(SEP) {
            return Ok(self.index.get(&format!("{}{}", path, SEP)));
        }
        self.index.lookup(path, self.client.as_ref())
    }

    fn record_error(&self, err: &anyhow::Error) {
        tracing::warn!(%err, "catalog operation degraded");
        *self.last_error.lock().unwrap() = Some(err.to_string());
    }

    fn guard<T>(&self, result: Result<T>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            Err(err) => {
                self.record_error(&err);
                fallback
            }
        }
    }
}
