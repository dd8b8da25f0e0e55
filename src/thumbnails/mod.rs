//! Two-tier thumbnail cache and generation pipeline.
//!
//! Lookups go memory first, then the persistent store; misses are generated
//! by a background worker pool and delivered as [`ThumbnailEvent`]s.

mod bitmap;
pub mod decoder;
mod key;
mod memory;
mod persistent;
mod placeholder;
mod service;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use bitmap::Bitmap;
pub use decoder::{probe, Decoder, ImageProbe, StandardDecoder};
pub use key::{fingerprint, normalize_path, source_fingerprint, CacheKey};
pub use memory::MemoryCache;
pub use persistent::{decode_blob, encode_bitmap, PersistentCache};
pub use placeholder::{PlaceholderFactory, PlaceholderKind};
pub use service::{ClearScope, Removed, StatsSnapshot, ThumbnailEvent, ThumbnailService};
pub use worker::Priority;

/// Monotonic counter identifying "what the consumer is currently showing".
///
/// Every request captures the current token; results whose token no longer
/// matches are cached but never delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReloadToken(pub u64);

impl ReloadToken {
    pub fn next(self) -> Self {
        ReloadToken(self.0.wrapping_add(1))
    }
}

/// Opaque consumer tag (for a list view, typically the row) echoed back in
/// every event for the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestContext(pub u64);
