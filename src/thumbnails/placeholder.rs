//! Lightweight stand-in bitmaps shown while a thumbnail is pending or after
//! generation failed.

use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::sync::Mutex;

use super::Bitmap;
use crate::error::DecodeErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    /// Generation is queued or running.
    Loading,
    /// Decode failed (timeout, corrupt, unsupported).
    Unavailable,
    /// The source file is gone.
    Missing,
}

impl PlaceholderKind {
    pub fn for_error(kind: DecodeErrorKind) -> Self {
        match kind {
            DecodeErrorKind::NotFound => PlaceholderKind::Missing,
            _ => PlaceholderKind::Unavailable,
        }
    }
}

const BACKGROUND: Rgba<u8> = Rgba([48, 48, 52, 255]);
const FRAME: Rgba<u8> = Rgba([90, 90, 96, 255]);
const MARK: Rgba<u8> = Rgba([140, 140, 148, 255]);
const MISSING_MARK: Rgba<u8> = Rgba([170, 70, 70, 255]);

/// Builds placeholders and hands out the same bitmap for repeated requests.
#[derive(Default)]
pub struct PlaceholderFactory {
    cache: Mutex<HashMap<(PlaceholderKind, u32), Bitmap>>,
}

impl PlaceholderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Square placeholder of side `height` (at least 1px).
    pub fn get(&self, kind: PlaceholderKind, height: u32) -> Bitmap {
        let height = height.max(1);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry((kind, height))
            .or_insert_with(|| Bitmap::new(render(kind, height)))
            .clone()
    }
}

fn render(kind: PlaceholderKind, size: u32) -> RgbaImage {
    let mut image = RgbaImage::from_pixel(size, size, BACKGROUND);
    if size < 4 {
        return image;
    }

    let last = size - 1;
    for i in 0..size {
        image.put_pixel(i, 0, FRAME);
        image.put_pixel(i, last, FRAME);
        image.put_pixel(0, i, FRAME);
        image.put_pixel(last, i, FRAME);
    }

    match kind {
        PlaceholderKind::Loading => {
            // three dots across the middle
            let mid = size / 2;
            let radius = (size / 24).max(1);
            for cx in [size / 4, mid, size - size / 4] {
                fill_square(&mut image, cx, mid, radius, MARK);
            }
        }
        PlaceholderKind::Unavailable | PlaceholderKind::Missing => {
            let color = if kind == PlaceholderKind::Missing {
                MISSING_MARK
            } else {
                MARK
            };
            let inset = size / 4;
            for i in inset..=(last - inset) {
                image.put_pixel(i, i, color);
                image.put_pixel(last - i, i, color);
            }
        }
    }

    image
}

fn fill_square(image: &mut RgbaImage, cx: u32, cy: u32, radius: u32, color: Rgba<u8>) {
    let (w, h) = image.dimensions();
    for y in cy.saturating_sub(radius)..=(cy + radius).min(h - 1) {
        for x in cx.saturating_sub(radius)..=(cx + radius).min(w - 1) {
            image.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_sized_and_stable() {
        let factory = PlaceholderFactory::new();
        let a = factory.get(PlaceholderKind::Unavailable, 160);
        let b = factory.get(PlaceholderKind::Unavailable, 160);

        assert_eq!((a.width(), a.height()), (160, 160));
        assert!(a.ptr_eq(&b));
        assert_ne!(a, factory.get(PlaceholderKind::Missing, 160));
        assert_ne!(a, factory.get(PlaceholderKind::Loading, 160));
    }

    #[test]
    fn test_tiny_and_zero_sizes() {
        let factory = PlaceholderFactory::new();
        assert_eq!(factory.get(PlaceholderKind::Loading, 0).height(), 1);
        assert_eq!(factory.get(PlaceholderKind::Missing, 3).width(), 3);
        assert_eq!(factory.get(PlaceholderKind::Loading, 4).height(), 4);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            PlaceholderKind::for_error(DecodeErrorKind::NotFound),
            PlaceholderKind::Missing
        );
        assert_eq!(
            PlaceholderKind::for_error(DecodeErrorKind::Timeout),
            PlaceholderKind::Unavailable
        );
    }
}
