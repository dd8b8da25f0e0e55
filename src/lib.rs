//! Thumbnail cache and generation pipeline for photo browsers.
//!
//! [`ThumbnailService`] answers thumbnail requests from an in-memory LRU,
//! then from a SQLite-backed persistent tier, and otherwise generates them on
//! a background worker pool with a hard per-decode timeout.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod scanner;
pub mod thumbnails;

pub use config::Config;
pub use db::{SqliteDb, ThumbnailStore};
pub use error::{DecodeError, DecodeErrorKind, StoreError, ThumbnailError};
pub use thumbnails::{
    Bitmap, CacheKey, ClearScope, Decoder, PlaceholderKind, ReloadToken, RequestContext,
    StandardDecoder, ThumbnailEvent, ThumbnailService,
};
