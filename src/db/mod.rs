//! Metadata store collaborator.
//!
//! The thumbnail pipeline only ever talks to the store through
//! [`ThumbnailStore`]; the SQLite backend is the implementation shipped with
//! the crate.

mod schema;
pub mod sqlite;

pub use schema::SCHEMA;
pub use sqlite::SqliteDb;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Metadata recorded for a source photo.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoRecord {
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size_bytes: i64,
    pub modified_at: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    /// EXIF orientation (1-8), 1 when unknown.
    pub orientation: u32,
    pub taken_at: Option<String>,
}

/// A thumbnail blob as held by the persistent tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedThumbnail {
    pub key_digest: String,
    pub source_path: String,
    pub height: u32,
    pub data: Vec<u8>,
    pub source_fingerprint: String,
}

/// Storage operations the thumbnail subsystem depends on.
///
/// Implementations must be safe to call from several threads at once.
pub trait ThumbnailStore: Send + Sync {
    /// Get photo metadata by path
    fn get_photo(&self, path: &str) -> StoreResult<Option<PhotoRecord>>;

    /// Insert or replace photo metadata
    fn upsert_photo(&self, photo: &PhotoRecord) -> StoreResult<()>;

    fn get_thumbnail_blob(&self, key_digest: &str) -> StoreResult<Option<PersistedThumbnail>>;

    /// Insert or replace a thumbnail blob
    fn put_thumbnail_blob(&self, thumbnail: &PersistedThumbnail) -> StoreResult<()>;

    fn delete_thumbnail_blob(&self, key_digest: &str) -> StoreResult<()>;

    /// Digests of every blob generated from `source_path`, at any height
    fn thumbnail_digests_for_path(&self, source_path: &str) -> StoreResult<Vec<String>>;

    /// Delete blobs whose source path starts with `path_prefix`, or all blobs
    /// when `None`. Returns the number removed.
    fn clear_thumbnails(&self, path_prefix: Option<&str>) -> StoreResult<usize>;

    fn count_thumbnails(&self) -> StoreResult<usize>;

    /// Blob count per thumbnail height, ascending by height
    fn thumbnail_counts_by_height(&self) -> StoreResult<Vec<(u32, usize)>>;
}
