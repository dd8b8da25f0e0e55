//! Cache keys and source fingerprints.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Identity of one thumbnail: a normalized source path at a target height.
///
/// Two spellings of the same file (trailing separators, `.`/`..` segments,
/// symlinks, case on case-insensitive filesystems) produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: PathBuf,
    height: u32,
}

impl CacheKey {
    pub fn new(path: &Path, height: u32) -> Self {
        Self {
            path: normalize_path(path),
            height,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Stable storage key for the persistent tier.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.path_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.height.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether this key's source lives under `dir` (already normalized).
    pub fn is_under(&self, dir: &Path) -> bool {
        self.path.starts_with(dir)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path.display(), self.height)
    }
}

/// Normalize a path for use as cache identity.
///
/// Existing files are canonicalized (resolving symlinks). For paths that no
/// longer exist the longest existing ancestor is canonicalized and the rest is
/// cleaned up lexically, so a deleted file still maps to the key it was cached
/// with.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let resolved = fs::canonicalize(&absolute)
        .unwrap_or_else(|_| canonicalize_existing_prefix(&lexical_normalize(&absolute)));
    fold_case(strip_verbatim(resolved))
}

fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    for ancestor in path.ancestors().skip(1) {
        if let Ok(base) = fs::canonicalize(ancestor) {
            return match path.strip_prefix(ancestor) {
                Ok(rest) => base.join(rest),
                Err(_) => path.to_path_buf(),
            };
        }
    }
    path.to_path_buf()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(windows)]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix(r"\\?\") {
        Some(rest) if !rest.starts_with("UNC") => PathBuf::from(rest),
        _ => path,
    }
}

#[cfg(not(windows))]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    path
}

#[cfg(any(windows, target_os = "macos"))]
fn fold_case(path: PathBuf) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

#[cfg(not(any(windows, target_os = "macos")))]
fn fold_case(path: PathBuf) -> PathBuf {
    path
}

/// Size + modification time of a source file, used to detect stale blobs.
pub fn fingerprint(metadata: &fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default();
    format!("{}@{}", metadata.len(), mtime)
}

pub fn source_fingerprint(path: &Path) -> std::io::Result<String> {
    fs::metadata(path).map(|m| fingerprint(&m))
}
