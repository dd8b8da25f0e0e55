//! In-process thumbnail tier: a bounded LRU of decoded bitmaps.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{Bitmap, CacheKey};

struct Inner {
    entries: LruCache<CacheKey, Bitmap>,
    bytes: usize,
}

/// LRU map from cache key to bitmap, bounded by entry count and optionally
/// by total pixel bytes.
///
/// One mutex guards the map; every operation holds it only for the map
/// update itself, never across I/O.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_bytes: Option<usize>,
}

impl MemoryCache {
    /// `capacity` of 0 is treated as 1; `max_bytes` of 0 disables byte accounting.
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes: (max_bytes > 0).then_some(max_bytes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section leaves the map consistent, so a panic
        // elsewhere never invalidates it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`, promoting it to most recently used on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Bitmap> {
        self.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Insert `bitmap`, evicting least recently used entries beyond capacity.
    pub fn put(&self, key: CacheKey, bitmap: Bitmap) {
        let mut inner = self.lock();
        let added = bitmap.byte_size();

        if let Some((old_key, old)) = inner.entries.push(key.clone(), bitmap) {
            inner.bytes -= old.byte_size();
            if old_key != key {
                tracing::trace!(key = %old_key, "Evicted thumbnail from memory");
            }
        }
        inner.bytes += added;

        if let Some(max) = self.max_bytes {
            // Keep at least the entry just inserted
            while inner.bytes > max && inner.entries.len() > 1 {
                match inner.entries.pop_lru() {
                    Some((old_key, old)) => {
                        inner.bytes -= old.byte_size();
                        tracing::trace!(key = %old_key, "Evicted thumbnail over byte budget");
                    }
                    None => break,
                }
            }
        }
    }

    /// Drop every entry whose source path is `path`, at any height.
    pub fn remove_path(&self, path: &Path) -> usize {
        self.remove_where(|key| key.path() == path)
    }

    /// Drop every entry whose source lives under `dir`.
    pub fn remove_under(&self, dir: &Path) -> usize {
        self.remove_where(|key| key.is_under(dir))
    }

    fn remove_where(&self, matches: impl Fn(&CacheKey) -> bool) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(key, _)| matches(key))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            if let Some(bitmap) = inner.entries.pop(key) {
                inner.bytes -= bitmap.byte_size();
            }
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.lock().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(&PathBuf::from(format!("/photos/{}", name)), 10)
    }

    fn bitmap(shade: u8) -> Bitmap {
        Bitmap::new(RgbaImage::from_pixel(2, 2, Rgba([shade, shade, shade, 255])))
    }

    #[test]
    fn test_evicts_least_recently_inserted() {
        let cache = MemoryCache::new(3, 0);
        cache.put(key("a"), bitmap(1));
        cache.put(key("b"), bitmap(2));
        cache.put(key("c"), bitmap(3));
        cache.put(key("d"), bitmap(4));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("d")));
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = MemoryCache::new(3, 0);
        cache.put(key("a"), bitmap(1));
        cache.put(key("b"), bitmap(2));
        cache.put(key("c"), bitmap(3));

        // Touch "a" so "b" becomes the oldest
        assert_eq!(cache.get(&key("a")), Some(bitmap(1)));
        cache.put(key("d"), bitmap(4));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert!(cache.contains(&key("d")));
    }

    #[test]
    fn test_replace_keeps_byte_count() {
        let cache = MemoryCache::new(3, 0);
        cache.put(key("a"), bitmap(1));
        cache.put(key("a"), bitmap(9));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.byte_size(), 16);
        assert_eq!(cache.get(&key("a")), Some(bitmap(9)));
    }

    #[test]
    fn test_byte_budget() {
        // Each bitmap is 16 bytes; budget fits two
        let cache = MemoryCache::new(10, 32);
        cache.put(key("a"), bitmap(1));
        cache.put(key("b"), bitmap(2));
        cache.put(key("c"), bitmap(3));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.byte_size(), 32);
    }

    #[test]
    fn test_remove_path_and_dir() {
        let cache = MemoryCache::new(10, 0);
        let path = PathBuf::from("/photos/trip/a.jpg");
        cache.put(CacheKey::new(&path, 80), bitmap(1));
        cache.put(CacheKey::new(&path, 160), bitmap(2));
        cache.put(CacheKey::new(&PathBuf::from("/photos/trip/b.jpg"), 80), bitmap(3));
        cache.put(CacheKey::new(&PathBuf::from("/elsewhere/c.jpg"), 80), bitmap(4));

        assert_eq!(cache.remove_path(&path), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.remove_under(Path::new("/photos")), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.byte_size(), 0);
    }
}
