//! Directory walking and cache warming.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use walkdir::WalkDir;

use crate::config::ScannerConfig;
use crate::thumbnails::ThumbnailService;

/// All files under `directory` whose extension is in `extensions`
/// (case-insensitive), sorted by path.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if entry.file_type().is_file() {
            if let Some(ext) = path.extension() {
                let ext_lower = ext.to_string_lossy().to_lowercase();
                if extensions.iter().any(|e| e.to_lowercase() == ext_lower) {
                    images.push(path.to_path_buf());
                }
            }
        }
    }

    images.sort();

    Ok(images)
}

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { total_files: usize },
    Warmed { current: usize, total: usize, path: String },
    Failed { path: String, reason: String },
    Completed { warmed: usize, failed: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub total: usize,
    pub warmed: usize,
    pub failed: usize,
}

pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Record metadata for and generate a thumbnail of every image under
    /// `directory`, spreading the work over a pool of `parallelism` threads.
    pub fn warm_directory(
        &self,
        directory: &Path,
        service: &ThumbnailService,
        height: u32,
        parallelism: usize,
        progress_tx: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<ScanResult> {
        let image_paths = discover_images(directory, &self.config.image_extensions)?;
        let total = image_paths.len();
        tracing::info!(directory = %directory.display(), total, "Warming thumbnail cache");

        if let Some(ref tx) = progress_tx {
            let _ = tx.send(ScanProgress::Started { total_files: total });
        }

        let done = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .thread_name(|i| format!("thumb-warm-{}", i))
            .build()
            .context("Failed to build warm thread pool")?;

        pool.install(|| {
            image_paths
                .par_iter()
                .for_each_with(progress_tx.clone(), |progress_tx, path| {
                    let outcome = service
                        .record_metadata(path)
                        .and_then(|_| service.load_thumbnail(path, height));
                    let current = done.fetch_add(1, Ordering::Relaxed) + 1;

                    let progress = match outcome {
                        Ok(_) => ScanProgress::Warmed {
                            current,
                            total,
                            path: path.to_string_lossy().to_string(),
                        },
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            ScanProgress::Failed {
                                path: path.to_string_lossy().to_string(),
                                reason: e.to_string(),
                            }
                        }
                    };
                    if let Some(tx) = progress_tx {
                        let _ = tx.send(progress);
                    }
                });
        });

        let failed = failed.into_inner();
        let result = ScanResult {
            total,
            warmed: total - failed,
            failed,
        };
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(ScanProgress::Completed {
                warmed: result.warmed,
                failed: result.failed,
            });
        }

        tracing::info!(warmed = result.warmed, failed = result.failed, "Warm finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThumbnailConfig;
    use crate::db::ThumbnailStore;
    use crate::thumbnails::testing::{memory_store, write_png};
    use crate::thumbnails::StandardDecoder;
    use std::fs::{self, File};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let images = discover_images(dir.path(), &extensions).unwrap();

        assert_eq!(images.len(), 3);
        assert!(images.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_warm_directory_counts_failures() {
        let dir = tempdir().unwrap();
        write_png(dir.path(), "a.png", 40, 20);
        write_png(dir.path(), "b.png", 20, 40);
        fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let store = memory_store();
        let (service, _events) =
            ThumbnailService::start(ThumbnailConfig::default(), store.clone(), Arc::new(StandardDecoder))
                .unwrap();
        let (tx, rx) = mpsc::channel();

        let scanner = Scanner::new(ScannerConfig::default());
        let result = scanner
            .warm_directory(dir.path(), &service, 32, 2, Some(tx))
            .unwrap();

        assert_eq!(result, ScanResult { total: 3, warmed: 2, failed: 1 });
        assert_eq!(store.count_thumbnails().unwrap(), 2);

        let progress: Vec<ScanProgress> = rx.try_iter().collect();
        assert!(matches!(progress.first(), Some(ScanProgress::Started { total_files: 3 })));
        assert!(matches!(
            progress.last(),
            Some(ScanProgress::Completed { warmed: 2, failed: 1 })
        ));
    }
}
