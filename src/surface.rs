use std::path::Path;

use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use tracing::instrument;

use crate::{
    error::{OcrError, Result},
    BoundingBox,
};

const UNKNOWN_MEDIA_TYPE: &str = "application/octet-stream";
/// Slack for edges that land a rounding error past a pixel boundary.
const EDGE_EPSILON: f32 = 1e-3;

/// A user-selected file, as handed over by the front end.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            bytes,
        }
    }

    /// Reads a file and declares its media type from the extension, the way
    /// a browser file input does. Contents are not sniffed.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let media_type = ImageFormat::from_path(path)
            .map(|format| format.to_mime_type())
            .unwrap_or(UNKNOWN_MEDIA_TYPE);
        Ok(Self::new(path.display().to_string(), media_type, bytes))
    }

    pub fn validate(&self) -> Result<()> {
        if self.media_type.starts_with("image/") {
            Ok(())
        } else {
            Err(OcrError::InputValidation {
                name: self.name.clone(),
                reason: format!("media type {} is not an image", self.media_type),
            })
        }
    }

    #[instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub fn decode(&self) -> Result<DynamicImage> {
        let image = image::load_from_memory(&self.bytes).map_err(|source| OcrError::Decode {
            name: self.name.clone(),
            source,
        })?;
        if image.width() == 0 || image.height() == 0 {
            return Err(OcrError::InputValidation {
                name: self.name.clone(),
                reason: "image has no pixels".to_string(),
            });
        }
        Ok(image)
    }
}

/// Offscreen drawing surface holding the most recently ingested bitmap.
#[derive(Debug, Clone, Default)]
pub struct Surface {
    image: RgbImage,
}

impl Surface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes the surface to the bitmap's native size and paints it.
    pub fn draw(&mut self, bitmap: &DynamicImage) {
        self.image = bitmap.to_rgb8();
    }

    pub fn from_bitmap(bitmap: &DynamicImage) -> Self {
        let mut surface = Self::new();
        surface.draw(bitmap);
        surface
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Returns the pixels under `rect`, expanded to whole pixels and clipped
    /// to the surface. May be empty.
    pub fn crop(&self, rect: &BoundingBox) -> RgbImage {
        let (width, height) = self.dimensions();
        let left = ((rect.x + EDGE_EPSILON).floor().max(0.0) as u32).min(width);
        let top = ((rect.y + EDGE_EPSILON).floor().max(0.0) as u32).min(height);
        let right = ((rect.right() - EDGE_EPSILON).ceil().max(0.0) as u32).clamp(left, width);
        let bottom = ((rect.bottom() - EDGE_EPSILON).ceil().max(0.0) as u32).clamp(top, height);
        log::trace!("Cropping surface to ({left}, {top})..({right}, {bottom})");
        image::imageops::crop_imm(&self.image, left, top, right - left, bottom - top).to_image()
    }

    /// Downscales so the longer side fits `max_side_len` and both sides are
    /// multiples of 32. Returns the surface unchanged when it already fits.
    pub fn fit_to(&self, max_side_len: u32) -> RgbImage {
        let (width, height) = fit_dimensions(self.dimensions(), max_side_len);
        if (width, height) == self.dimensions() {
            return self.image.clone();
        }
        log::debug!(
            "Resizing detector input from (w: {}, h: {}) to (w: {width}, h: {height})",
            self.width(),
            self.height()
        );
        image::imageops::resize(&self.image, width, height, FilterType::Triangle)
    }
}

fn fit_dimensions((width, height): (u32, u32), max_side_len: u32) -> (u32, u32) {
    if width.max(height) <= max_side_len && width % 32 == 0 && height % 32 == 0 {
        return (width, height);
    }
    let aspect_ratio = width as f32 / height as f32;
    let (target_width, target_height) = if aspect_ratio >= 1.0 {
        let target_width = width.min(max_side_len);
        (target_width, (target_width as f32 / aspect_ratio) as u32)
    } else {
        let target_height = height.min(max_side_len);
        ((target_height as f32 * aspect_ratio) as u32, target_height)
    };
    (
        (target_width / 32 * 32).max(32),
        (target_height / 32 * 32).max(32),
    )
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn non_image_media_type_is_rejected() {
        let upload = Upload::new("notes.txt", "text/plain", b"hello".to_vec());
        assert!(matches!(
            upload.validate(),
            Err(OcrError::InputValidation { .. })
        ));
        assert!(Upload::new("a.png", "image/png", Vec::new())
            .validate()
            .is_ok());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let upload = Upload::new("broken.png", "image/png", vec![0, 1, 2, 3]);
        assert!(matches!(upload.decode(), Err(OcrError::Decode { .. })));
    }

    #[test]
    fn draw_takes_bitmap_dimensions() {
        let mut surface = Surface::new();
        assert_eq!(surface.dimensions(), (0, 0));
        surface.draw(&DynamicImage::new_rgb8(100, 50));
        assert_eq!(surface.dimensions(), (100, 50));
        surface.draw(&DynamicImage::new_rgba8(7, 9));
        assert_eq!(surface.dimensions(), (7, 9));
    }

    #[test]
    fn crop_is_clipped_to_surface() {
        let mut bitmap = RgbImage::new(10, 10);
        bitmap.put_pixel(9, 9, Rgb([1, 2, 3]));
        let surface = Surface::from_bitmap(&DynamicImage::ImageRgb8(bitmap));

        let crop = surface.crop(&BoundingBox::from_edges(7.5, 8.0, 14.0, 20.0));
        assert_eq!(crop.dimensions(), (3, 2));
        assert_eq!(crop.get_pixel(2, 1), &Rgb([1, 2, 3]));

        let outside = surface.crop(&BoundingBox::from_edges(12.0, 12.0, 20.0, 20.0));
        assert_eq!(outside.dimensions(), (0, 0));
    }

    #[test]
    fn fit_floors_to_multiples_of_32() {
        assert_eq!(fit_dimensions((64, 32), 1024), (64, 32));
        assert_eq!(fit_dimensions((100, 50), 1024), (96, 32));
        assert_eq!(fit_dimensions((2000, 1000), 1024), (1024, 512));
        assert_eq!(fit_dimensions((10, 400), 256), (32, 256));
    }
}
