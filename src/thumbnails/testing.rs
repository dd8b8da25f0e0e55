//! Stub decoders and fixtures shared by the thumbnail tests.

use image::{DynamicImage, Rgba, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use super::{Bitmap, Decoder};
use crate::db::{PersistedThumbnail, PhotoRecord, SqliteDb, StoreResult, ThumbnailStore};
use crate::error::{DecodeError, DecodeErrorKind, StoreError};

pub fn memory_store() -> Arc<SqliteDb> {
    let db = SqliteDb::open_in_memory().unwrap();
    db.initialize().unwrap();
    Arc::new(db)
}

pub fn gradient_image(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
            255,
        ])
    })
}

pub fn gradient(width: u32, height: u32) -> Bitmap {
    Bitmap::new(gradient_image(width, height))
}

pub fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    gradient_image(width, height).save(&path).unwrap();
    path
}

/// Returns a gradient for any path and counts calls per path.
pub struct CountingDecoder {
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<PathBuf>>,
    delay: Duration,
}

impl CountingDecoder {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for CountingDecoder {
    fn decode(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(path.to_path_buf());
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(DynamicImage::ImageRgba8(gradient_image(64, 48)))
    }
}

/// Never returns in any reasonable time.
pub struct HangingDecoder;

impl Decoder for HangingDecoder {
    fn decode(&self, _path: &Path) -> Result<DynamicImage, DecodeError> {
        thread::sleep(Duration::from_secs(3600));
        Err(DecodeError::InvalidRequest("unreachable".into()))
    }
}

/// Always fails with the configured kind.
pub struct FailingDecoder {
    pub kind: DecodeErrorKind,
    pub calls: AtomicUsize,
}

impl FailingDecoder {
    pub fn new(kind: DecodeErrorKind) -> Self {
        Self {
            kind,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Decoder for FailingDecoder {
    fn decode(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = path.to_path_buf();
        Err(match self.kind {
            DecodeErrorKind::Timeout => DecodeError::Timeout {
                path,
                after: Duration::from_millis(1),
            },
            DecodeErrorKind::Corrupt => DecodeError::Corrupt {
                path,
                reason: "bad huffman table".into(),
            },
            DecodeErrorKind::Unsupported => DecodeError::Unsupported {
                path,
                detail: "heic".into(),
            },
            DecodeErrorKind::NotFound => DecodeError::NotFound { path },
            DecodeErrorKind::InvalidRequest => DecodeError::InvalidRequest("stub".into()),
        })
    }
}

/// Blocks each decode until the test opens the gate.
pub struct GatedDecoder {
    gate: Mutex<bool>,
    opened: Condvar,
    pub calls: AtomicUsize,
}

impl GatedDecoder {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(false),
            opened: Condvar::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.opened.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for GatedDecoder {
    fn decode(&self, _path: &Path) -> Result<DynamicImage, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        Ok(DynamicImage::ImageRgba8(gradient_image(40, 30)))
    }
}

/// In-memory SQLite store whose blob writes can be held at a gate or made
/// to fail.
pub struct ScriptedStore {
    inner: Arc<SqliteDb>,
    fail_puts: bool,
    gate: Mutex<bool>,
    opened: Condvar,
    puts: AtomicUsize,
}

impl ScriptedStore {
    /// Every put blocks until [`open`](Self::open) is called.
    pub fn gated() -> Self {
        Self::build(false, false)
    }

    /// Every put fails with an I/O error.
    pub fn failing_puts() -> Self {
        Self::build(true, true)
    }

    fn build(fail_puts: bool, open: bool) -> Self {
        Self {
            inner: memory_store(),
            fail_puts,
            gate: Mutex::new(open),
            opened: Condvar::new(),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.opened.notify_all();
    }

    /// Puts started so far, including any still waiting at the gate.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ThumbnailStore for ScriptedStore {
    fn get_photo(&self, path: &str) -> StoreResult<Option<PhotoRecord>> {
        self.inner.get_photo(path)
    }

    fn upsert_photo(&self, photo: &PhotoRecord) -> StoreResult<()> {
        self.inner.upsert_photo(photo)
    }

    fn get_thumbnail_blob(&self, key_digest: &str) -> StoreResult<Option<PersistedThumbnail>> {
        self.inner.get_thumbnail_blob(key_digest)
    }

    fn put_thumbnail_blob(&self, thumbnail: &PersistedThumbnail) -> StoreResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);

        if self.fail_puts {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put_thumbnail_blob(thumbnail)
    }

    fn delete_thumbnail_blob(&self, key_digest: &str) -> StoreResult<()> {
        self.inner.delete_thumbnail_blob(key_digest)
    }

    fn thumbnail_digests_for_path(&self, source_path: &str) -> StoreResult<Vec<String>> {
        self.inner.thumbnail_digests_for_path(source_path)
    }

    fn clear_thumbnails(&self, path_prefix: Option<&str>) -> StoreResult<usize> {
        self.inner.clear_thumbnails(path_prefix)
    }

    fn count_thumbnails(&self) -> StoreResult<usize> {
        self.inner.count_thumbnails()
    }

    fn thumbnail_counts_by_height(&self) -> StoreResult<Vec<(u32, usize)>> {
        self.inner.thumbnail_counts_by_height()
    }
}
