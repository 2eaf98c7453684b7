pub mod cache;
pub mod path_index;
pub mod roots;
pub mod service;
pub mod tags;

pub use cache::{CacheLoad, FileRecordCache};
pub use path_index::PathIndex;
pub use roots::{CollectionEnumerator, RootsOutcome};
pub use service::{CatalogError, DirectoryService, RefreshHandle};
pub use tags::{project, TagRecord, TagSlot, TAG_SLOTS};

/// Separator of the virtual hierarchy exposed to callers. The remote side
/// uses forward slashes; everything crossing the boundary gets normalized.
pub const SEP: char = '\\';

/// Remote relative path (forward slashes) to virtual path form.
pub fn to_virtual(remote_path: &str) -> String {
    remote_path.replace('/', "\\")
}

/// Parent of a virtual path, or None for root-level paths.
pub fn parent_of(path: &str) -> Option<&str> {
    path.rfind(SEP).map(|idx| &path[..idx])
}

/// First segment of a virtual path (the collection name for qualified paths).
pub fn first_segment(path: &str) -> &str {
    path.split(SEP).next().unwrap_or(path)
}
