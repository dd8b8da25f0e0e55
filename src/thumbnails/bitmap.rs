use image::{DynamicImage, RgbaImage};
use std::fmt;
use std::sync::Arc;

/// A decoded, display-ready thumbnail.
///
/// Cheap to clone: pixels are shared behind an `Arc`, so the same bitmap can
/// sit in the memory tier and be handed to any number of consumers.
#[derive(Clone)]
pub struct Bitmap {
    pixels: Arc<RgbaImage>,
}

impl Bitmap {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::new(image.into_rgba8())
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Approximate heap footprint, used by the memory tier's byte budget.
    pub fn byte_size(&self) -> usize {
        self.pixels.as_raw().len()
    }

    /// True when both handles share the same pixel buffer.
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
            || (self.pixels.dimensions() == other.pixels.dimensions()
                && self.pixels.as_raw() == other.pixels.as_raw())
    }
}

impl Eq for Bitmap {}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_equality_compares_pixels() {
        let a = Bitmap::new(RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 255])));
        let b = Bitmap::new(RgbaImage::from_pixel(4, 2, Rgba([1, 2, 3, 255])));
        let c = Bitmap::new(RgbaImage::from_pixel(4, 2, Rgba([9, 2, 3, 255])));

        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert_ne!(a, c);
        assert!(a.ptr_eq(&a.clone()));
        assert_eq!(a.byte_size(), 4 * 2 * 4);
    }
}
