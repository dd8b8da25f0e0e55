use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on background generation threads.
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// Encoding used for blobs in the persistent tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobFormat {
    #[default]
    Jpeg,
    Png,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    /// Maximum number of decoded thumbnails kept in memory.
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// Optional byte budget for the memory tier; 0 disables byte accounting.
    #[serde(default)]
    pub l1_max_bytes: usize,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Wall-clock budget for a full thumbnail decode.
    #[serde(default = "default_decode_timeout_secs")]
    pub decode_timeout_secs: f64,

    /// Wall-clock budget for a metadata probe (dimensions, EXIF).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: f64,

    /// Neighbours warmed on each side when the consumer moves.
    #[serde(default = "default_prefetch_radius")]
    pub prefetch_radius: usize,

    #[serde(default = "default_height")]
    pub default_height: u32,

    /// Emit a low resolution preview before the full thumbnail.
    #[serde(default = "default_progressive")]
    pub progressive: bool,

    #[serde(default = "default_preview_divisor")]
    pub preview_divisor: u32,

    #[serde(default)]
    pub blob_format: BlobFormat,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Re-stat the source on every persistent hit and drop stale blobs.
    /// Off by default: blobs are trusted until explicitly invalidated.
    #[serde(default)]
    pub validate_on_read: bool,
}

fn default_l1_capacity() -> usize {
    500
}

fn default_worker_count() -> usize {
    4
}

fn default_decode_timeout_secs() -> f64 {
    5.0
}

fn default_probe_timeout_secs() -> f64 {
    2.0
}

fn default_prefetch_radius() -> usize {
    8
}

fn default_height() -> u32 {
    160
}

fn default_progressive() -> bool {
    true
}

fn default_preview_divisor() -> u32 {
    2
}

fn default_jpeg_quality() -> u8 {
    85
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l1_max_bytes: 0,
            worker_count: default_worker_count(),
            decode_timeout_secs: default_decode_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            prefetch_radius: default_prefetch_radius(),
            default_height: default_height(),
            progressive: default_progressive(),
            preview_divisor: default_preview_divisor(),
            blob_format: BlobFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            validate_on_read: false,
        }
    }
}

impl ThumbnailConfig {
    pub fn decode_timeout(&self) -> Duration {
        secs_to_duration(self.decode_timeout_secs, default_decode_timeout_secs())
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_to_duration(self.probe_timeout_secs, default_probe_timeout_secs())
    }

    /// Height of the progressive preview for a given target, if one applies.
    pub fn preview_height(&self, target_height: u32) -> Option<u32> {
        if !self.progressive || self.preview_divisor < 2 {
            return None;
        }
        let h = target_height / self.preview_divisor;
        (h > 0).then_some(h)
    }

    /// Return a copy with out-of-range values clamped, warning about each.
    pub fn validated(mut self) -> Self {
        if self.l1_capacity == 0 {
            tracing::warn!("thumbnails.l1_capacity must be at least 1, using 1");
            self.l1_capacity = 1;
        }
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            let clamped = self.worker_count.clamp(1, MAX_WORKERS);
            tracing::warn!(
                requested = self.worker_count,
                using = clamped,
                "thumbnails.worker_count out of range"
            );
            self.worker_count = clamped;
        }
        if !(self.decode_timeout_secs.is_finite() && self.decode_timeout_secs > 0.0) {
            tracing::warn!(value = self.decode_timeout_secs, "invalid decode_timeout_secs, using default");
            self.decode_timeout_secs = default_decode_timeout_secs();
        }
        if !(self.probe_timeout_secs.is_finite() && self.probe_timeout_secs > 0.0) {
            tracing::warn!(value = self.probe_timeout_secs, "invalid probe_timeout_secs, using default");
            self.probe_timeout_secs = default_probe_timeout_secs();
        }
        if self.default_height == 0 {
            tracing::warn!("thumbnails.default_height must be positive, using default");
            self.default_height = default_height();
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            tracing::warn!(value = self.jpeg_quality, "jpeg_quality out of range, using default");
            self.jpeg_quality = default_jpeg_quality();
        }
        self
    }
}

fn secs_to_duration(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "tif".to_string(),
        "tiff".to_string(),
        "heic".to_string(),
        "heif".to_string(),
        "dng".to_string(),
        "cr2".to_string(),
        "nef".to_string(),
        "arw".to_string(),
    ]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("thumbcache")
        .join("thumbcache.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            thumbnails: ThumbnailConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.thumbnails = config.thumbnails.validated();
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("thumbcache")
    }

    /// `THUMBCACHE_CONFIG` wins over the XDG location.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("THUMBCACHE_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [thumbnails]
            worker_count = 2
            blob_format = "png"
            "#,
        )
        .unwrap();

        assert_eq!(config.thumbnails.worker_count, 2);
        assert_eq!(config.thumbnails.blob_format, BlobFormat::Png);
        assert_eq!(config.thumbnails.l1_capacity, 500);
        assert_eq!(config.thumbnails.prefetch_radius, 8);
        assert!(!config.thumbnails.validate_on_read);
        assert!(config.scanner.image_extensions.contains(&"heic".to_string()));
    }

    #[test]
    fn test_validated_clamps_worker_count() {
        let config = ThumbnailConfig {
            worker_count: 32,
            l1_capacity: 0,
            decode_timeout_secs: -1.0,
            ..Default::default()
        }
        .validated();

        assert_eq!(config.worker_count, MAX_WORKERS);
        assert_eq!(config.l1_capacity, 1);
        assert_eq!(config.decode_timeout(), Duration::from_secs(5));

        let config = ThumbnailConfig {
            worker_count: 0,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.worker_count, 1);
    }

    #[test]
    fn test_preview_height() {
        let config = ThumbnailConfig::default();
        assert_eq!(config.preview_height(160), Some(80));
        assert_eq!(config.preview_height(1), None);

        let config = ThumbnailConfig {
            progressive: false,
            ..Default::default()
        };
        assert_eq!(config.preview_height(160), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.thumbnails.l1_capacity = 42;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.thumbnails.l1_capacity, 42);
    }
}
