//! Decoder adapter: source file in, scaled bitmap out, under a hard deadline.
//!
//! Every decode runs on its own thread. When the deadline passes the caller
//! stops waiting and gets [`DecodeError::Timeout`]; the decode thread is left
//! to finish on its own and whatever it produces is dropped, since the image
//! codecs offer no way to cancel a decode in progress.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::Bitmap;
use crate::error::DecodeError;

/// Extensions whose primary codec support is patchy; a failed primary decode
/// retries through the EXIF-embedded JPEG.
const FALLBACK_EXTENSIONS: &[&str] = &[
    "tif", "tiff", "dng", "cr2", "nef", "nrw", "arw", "srw", "orf", "rw2", "pef", "raf", "heic",
    "heif",
];

/// Source of full-resolution pixels for a file.
pub trait Decoder: Send + Sync {
    /// Decode the whole image with EXIF orientation applied.
    fn decode(&self, path: &Path) -> Result<DynamicImage, DecodeError>;

    /// A cheap, low resolution rendition for progressive previews.
    fn decode_preview(&self, _path: &Path) -> Option<DynamicImage> {
        None
    }
}

/// Decoder backed by the `image` crate, with EXIF for orientation and
/// embedded previews.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDecoder;

impl Decoder for StandardDecoder {
    fn decode(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        let metadata = fs::metadata(path).map_err(|e| DecodeError::from_io(path, &e))?;
        if !metadata.is_file() {
            return Err(DecodeError::InvalidRequest(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let image = match decode_primary(path) {
            Ok(image) => image,
            Err(primary) if wants_fallback(path, &primary) => match embedded_jpeg(path) {
                Some(image) => {
                    tracing::debug!(
                        path = %path.display(),
                        error = %primary,
                        "Primary decode failed, using embedded preview"
                    );
                    image
                }
                None => return Err(primary),
            },
            Err(primary) => return Err(primary),
        };

        Ok(apply_orientation(image, read_orientation(path)))
    }

    fn decode_preview(&self, path: &Path) -> Option<DynamicImage> {
        embedded_jpeg(path).map(|image| apply_orientation(image, read_orientation(path)))
    }
}

fn decode_primary(path: &Path) -> Result<DynamicImage, DecodeError> {
    ImageReader::open(path)
        .map_err(|e| DecodeError::from_io(path, &e))?
        .with_guessed_format()
        .map_err(|e| DecodeError::from_io(path, &e))?
        .decode()
        .map_err(|e| DecodeError::from_image(path, &e))
}

fn wants_fallback(path: &Path, err: &DecodeError) -> bool {
    if matches!(err, DecodeError::NotFound { .. }) {
        return false;
    }
    if matches!(err, DecodeError::Unsupported { .. }) {
        return true;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| FALLBACK_EXTENSIONS.contains(&ext.as_str()))
}

fn read_exif(path: &Path) -> Option<exif::Exif> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    exif::Reader::new().read_from_container(&mut reader).ok()
}

/// Decode the JPEG thumbnail stored in IFD1, present in most camera JPEGs,
/// TIFF-based raw files and HEIF containers.
fn embedded_jpeg(path: &Path) -> Option<DynamicImage> {
    let exif = read_exif(path)?;
    let offset = exif
        .get_field(exif::Tag::JPEGInterchangeFormat, exif::In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let length = exif
        .get_field(exif::Tag::JPEGInterchangeFormatLength, exif::In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;

    let bytes = exif.buf().get(offset..offset.checked_add(length)?)?;
    image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).ok()
}

/// EXIF orientation (1-8); 1 when absent or unreadable.
pub fn read_orientation(path: &Path) -> u32 {
    read_exif(path)
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .filter(|o| (1..=8).contains(o))
        .unwrap_or(1)
}

pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

fn scaled_width(image: &DynamicImage, target_height: u32) -> u32 {
    let (w, h) = (image.width().max(1) as u64, image.height().max(1) as u64);
    ((w * target_height as u64 + h / 2) / h).clamp(1, u32::MAX as u64) as u32
}

/// High quality resize to `target_height`, keeping aspect ratio.
pub fn scale_to_height(image: &DynamicImage, target_height: u32) -> DynamicImage {
    let width = scaled_width(image, target_height);
    image.resize_exact(width, target_height, FilterType::Lanczos3)
}

/// Fast resize used for previews.
pub fn scale_fast(image: &DynamicImage, target_height: u32) -> DynamicImage {
    let width = scaled_width(image, target_height);
    image.thumbnail_exact(width, target_height)
}

/// Run `work` on a dedicated thread and wait at most `timeout` for it.
pub fn run_with_timeout<T, F>(path: &Path, timeout: Duration, work: F) -> Result<T, DecodeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DecodeError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    spawn_decode_thread(path, move || {
        let _ = tx.send(work());
    })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(timed_out(path, timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(panicked(path)),
    }
}

enum Stage {
    Preview(Bitmap),
    Full(Result<Bitmap, DecodeError>),
}

/// Decode `path` and scale it to `target_height`, first handing a preview at
/// `preview_height` to `on_preview` when one is requested.
///
/// The whole operation, preview included, shares one `timeout` budget.
pub fn decode_progressive<F>(
    decoder: &Arc<dyn Decoder>,
    path: &Path,
    target_height: u32,
    preview_height: Option<u32>,
    timeout: Duration,
    mut on_preview: F,
) -> Result<Bitmap, DecodeError>
where
    F: FnMut(Bitmap),
{
    if target_height == 0 {
        return Err(DecodeError::InvalidRequest("target height must be positive".into()));
    }
    if timeout.is_zero() {
        return Err(DecodeError::InvalidRequest("timeout must be positive".into()));
    }

    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();
    let decoder = Arc::clone(decoder);
    let source: PathBuf = path.to_path_buf();
    let preview_height = preview_height.filter(|h| *h > 0 && *h < target_height);

    spawn_decode_thread(path, move || {
        let mut preview_sent = false;
        if let Some(height) = preview_height {
            if let Some(embedded) = decoder.decode_preview(&source) {
                preview_sent = tx
                    .send(Stage::Preview(Bitmap::from_dynamic(scale_fast(&embedded, height))))
                    .is_ok();
            }
        }

        let full = decoder.decode(&source).map(|image| {
            if let (Some(height), false) = (preview_height, preview_sent) {
                let _ = tx.send(Stage::Preview(Bitmap::from_dynamic(scale_fast(&image, height))));
            }
            Bitmap::from_dynamic(scale_to_height(&image, target_height))
        });
        // Receiver is gone if the caller already timed out.
        let _ = tx.send(Stage::Full(full));
    })?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Stage::Preview(bitmap)) => on_preview(bitmap),
            Ok(Stage::Full(result)) => return result,
            Err(RecvTimeoutError::Timeout) => return Err(timed_out(path, timeout)),
            Err(RecvTimeoutError::Disconnected) => return Err(panicked(path)),
        }
    }
}

/// `decode_and_scale` without a preview stage.
pub fn decode_and_scale(
    decoder: &Arc<dyn Decoder>,
    path: &Path,
    target_height: u32,
    timeout: Duration,
) -> Result<Bitmap, DecodeError> {
    decode_progressive(decoder, path, target_height, None, timeout, |_| {})
}

fn spawn_decode_thread<F>(path: &Path, work: F) -> Result<(), DecodeError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("thumb-decode".to_string())
        .spawn(work)
        .map(|_| ())
        .map_err(|e| DecodeError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("could not start decode thread: {}", e),
        })
}

fn timed_out(path: &Path, after: Duration) -> DecodeError {
    tracing::warn!(path = %path.display(), ?after, "Decode timed out, abandoning decode thread");
    DecodeError::Timeout {
        path: path.to_path_buf(),
        after,
    }
}

fn panicked(path: &Path) -> DecodeError {
    DecodeError::Corrupt {
        path: path.to_path_buf(),
        reason: "decoder panicked".to_string(),
    }
}

/// Cheap facts about a source image, gathered without a full decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProbe {
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub orientation: u32,
    pub taken_at: Option<String>,
}

/// Read dimensions, format and (opportunistically) EXIF orientation and
/// capture date, bounded by `timeout`.
pub fn probe(path: &Path, timeout: Duration) -> Result<ImageProbe, DecodeError> {
    let source = path.to_path_buf();
    run_with_timeout(path, timeout, move || probe_blocking(&source))
}

fn probe_blocking(path: &Path) -> Result<ImageProbe, DecodeError> {
    let reader = ImageReader::open(path)
        .map_err(|e| DecodeError::from_io(path, &e))?
        .with_guessed_format()
        .map_err(|e| DecodeError::from_io(path, &e))?;
    let format = reader.format().map(|f| format!("{:?}", f));

    let (width, height) = match reader.into_dimensions() {
        Ok(dims) => dims,
        Err(e) => {
            // Formats the image crate cannot read may still carry a preview
            let preview = embedded_jpeg(path).ok_or_else(|| DecodeError::from_image(path, &e))?;
            (preview.width(), preview.height())
        }
    };

    let mut probe = ImageProbe {
        width,
        height,
        format,
        orientation: 1,
        taken_at: None,
    };

    if let Some(exif) = read_exif(path) {
        if let Some(o) = exif
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .filter(|o| (1..=8).contains(o))
        {
            probe.orientation = o;
        }
        if let Some(field) = exif.get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY) {
            probe.taken_at = Some(field.display_value().to_string().trim_matches('"').to_string());
        }
    }

    Ok(probe)
}
