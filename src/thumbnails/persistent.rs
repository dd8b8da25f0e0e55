//! Durable thumbnail tier, read and written through the metadata store.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::key::source_fingerprint;
use super::{Bitmap, CacheKey};
use crate::config::{BlobFormat, ThumbnailConfig};
use crate::db::{PersistedThumbnail, ThumbnailStore};
use crate::error::StoreError;

/// Encode a thumbnail for storage.
pub fn encode_bitmap(bitmap: &Bitmap, format: BlobFormat, jpeg_quality: u8) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    match format {
        BlobFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(bitmap.pixels().clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, jpeg_quality).encode_image(&rgb)?;
        }
        BlobFormat::Png => {
            DynamicImage::ImageRgba8(bitmap.pixels().clone())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        }
    }
    Ok(buf)
}

/// Decode a stored blob back into a bitmap.
pub fn decode_blob(data: &[u8]) -> Result<Bitmap, image::ImageError> {
    image::load_from_memory(data).map(Bitmap::from_dynamic)
}

pub struct PersistentCache {
    store: Arc<dyn ThumbnailStore>,
    format: BlobFormat,
    jpeg_quality: u8,
    validate_on_read: bool,
}

impl PersistentCache {
    pub fn new(store: Arc<dyn ThumbnailStore>, config: &ThumbnailConfig) -> Self {
        Self {
            store,
            format: config.blob_format,
            jpeg_quality: config.jpeg_quality,
            validate_on_read: config.validate_on_read,
        }
    }

    pub fn store(&self) -> &Arc<dyn ThumbnailStore> {
        &self.store
    }

    pub fn encode(&self, bitmap: &Bitmap) -> Result<Vec<u8>, StoreError> {
        encode_bitmap(bitmap, self.format, self.jpeg_quality)
    }

    /// Fetch and decode the blob for `key`.
    ///
    /// Undecodable blobs, and stale ones when read validation is on, are
    /// deleted and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Bitmap>, StoreError> {
        self.read(key, true)
    }

    /// Like [`get`](Self::get) but never writes; unusable blobs are simply a
    /// miss and get replaced by the next successful generation.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Bitmap>, StoreError> {
        self.read(key, false)
    }

    fn read(&self, key: &CacheKey, purge: bool) -> Result<Option<Bitmap>, StoreError> {
        let digest = key.digest();
        let Some(blob) = self.store.get_thumbnail_blob(&digest)? else {
            return Ok(None);
        };

        if self.validate_on_read {
            let current = source_fingerprint(key.path()).ok();
            if current.as_deref() != Some(blob.source_fingerprint.as_str()) {
                tracing::debug!(key = %key, "Persisted thumbnail is stale");
                if purge {
                    self.store.delete_thumbnail_blob(&digest)?;
                }
                return Ok(None);
            }
        }

        match decode_blob(&blob.data) {
            Ok(bitmap) => Ok(Some(bitmap)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Persisted thumbnail unreadable");
                if purge {
                    self.store.delete_thumbnail_blob(&digest)?;
                }
                Ok(None)
            }
        }
    }

    pub fn put(&self, key: &CacheKey, data: Vec<u8>, fingerprint: String) -> Result<(), StoreError> {
        self.store.put_thumbnail_blob(&PersistedThumbnail {
            key_digest: key.digest(),
            source_path: key.path_str(),
            height: key.height(),
            data,
            source_fingerprint: fingerprint,
        })
    }

    /// Delete every blob generated from `path` (normalized).
    pub fn remove_path(&self, path: &Path) -> Result<usize, StoreError> {
        let digests = self
            .store
            .thumbnail_digests_for_path(&path.to_string_lossy())?;
        for digest in &digests {
            self.store.delete_thumbnail_blob(digest)?;
        }
        Ok(digests.len())
    }

    /// Delete blobs under `dir` (normalized), or everything when `None`.
    pub fn clear(&self, dir: Option<&Path>) -> Result<usize, StoreError> {
        match dir {
            Some(dir) => {
                let mut prefix = dir.to_string_lossy().into_owned();
                if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
                    prefix.push(std::path::MAIN_SEPARATOR);
                }
                self.store.clear_thumbnails(Some(&prefix))
            }
            None => self.store.clear_thumbnails(None),
        }
    }
}
