use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageReader, Luma};
use ndarray::Array4;
use std::path::Path;
use tracing::debug;

use crate::error::Result;

/// Côté du canevas carré attendu par l'encodeur.
pub const TARGET_SIZE: u32 = 224;

/// Niveaux de gris, redimensionnement avec ratio conservé sur canevas noir,
/// puis `(x / 255 - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessor {
    pub target_size: u32,
    pub mean: f32,
    pub std: f32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            target_size: TARGET_SIZE,
            mean: 0.5,
            std: 0.5,
        }
    }
}

impl Preprocessor {
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            ..Self::default()
        }
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<Array4<f32>> {
        let img = ImageReader::open(path.as_ref())?.with_guessed_format()?.decode()?;
        debug!(path = %path.as_ref().display(), width = img.width(), height = img.height(), "image décodée");
        Ok(self.process(&img))
    }

    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Array4<f32>> {
        let img = image::load_from_memory(bytes)?;
        Ok(self.process(&img))
    }

    /// Tenseur `(1, 1, target, target)` dans `[(0 - mean) / std, (1 - mean) / std]`.
    pub fn process(&self, img: &DynamicImage) -> Array4<f32> {
        let canvas = self.resize_with_padding(&to_luma(img));
        self.to_tensor(&canvas)
    }

    pub fn resize_with_padding(&self, gray: &GrayImage) -> GrayImage {
        let target = self.target_size;
        let (width, height) = gray.dimensions();
        // ratio et produits en f64, puis troncature : même taille que le
        // pipeline qui a produit les embeddings de référence
        let ratio = (target as f64 / width as f64).min(target as f64 / height as f64);
        let new_width = ((width as f64 * ratio) as u32).clamp(1, target);
        let new_height = ((height as f64 * ratio) as u32).clamp(1, target);

        let resized = imageops::resize(gray, new_width, new_height, FilterType::Lanczos3);
        let mut canvas = GrayImage::new(target, target);
        imageops::overlay(
            &mut canvas,
            &resized,
            ((target - new_width) / 2) as i64,
            ((target - new_height) / 2) as i64,
        );
        canvas
    }

    pub fn to_tensor(&self, gray: &GrayImage) -> Array4<f32> {
        let (width, height) = gray.dimensions();
        let mut array = Array4::zeros((1, 1, height as usize, width as usize));
        for (x, y, pixel) in gray.enumerate_pixels() {
            let value = pixel.0[0] as f32 / 255.0;
            array[[0, 0, y as usize, x as usize]] = (value - self.mean) / self.std;
        }
        array
    }
}

/// Luminance ITU-R 601-2, `L = (299 R + 587 G + 114 B) / 1000`.
pub fn to_luma(img: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = img {
        return gray.clone();
    }
    let rgb = img.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let luma = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
        Luma([luma as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{Rgb, RgbImage};

    #[test]
    fn wide_image_is_letterboxed() {
        let gray = GrayImage::from_pixel(448, 224, Luma([255]));
        let canvas = Preprocessor::default().resize_with_padding(&gray);

        assert_eq!(canvas.dimensions(), (224, 224));
        // 448x224 -> 224x112 collé en y = 56
        assert_eq!(canvas.get_pixel(112, 10).0[0], 0);
        assert_eq!(canvas.get_pixel(112, 112).0[0], 255);
        assert_eq!(canvas.get_pixel(112, 223).0[0], 0);
    }

    fn lit_extent(canvas: &GrayImage) -> (u32, u32) {
        let lit: Vec<(u32, u32)> = canvas
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] > 127)
            .map(|(x, y, _)| (x, y))
            .collect();
        let width = lit.iter().map(|p| p.0).max().unwrap() - lit.iter().map(|p| p.0).min().unwrap() + 1;
        let height = lit.iter().map(|p| p.1).max().unwrap() - lit.iter().map(|p| p.1).min().unwrap() + 1;
        (width, height)
    }

    #[test]
    fn scaled_size_is_floored_in_double_precision() {
        let preprocessor = Preprocessor::default();
        for (width, expected) in [(270, (224, 82)), (277, (223, 80)), (281, (224, 79))] {
            let white = GrayImage::from_pixel(width, 100, Luma([255]));
            let canvas = preprocessor.resize_with_padding(&white);
            let ratio = (224.0 / width as f64).min(224.0 / 100.0);
            assert_eq!(
                ((width as f64 * ratio) as u32, (100.0 * ratio) as u32),
                expected,
                "width {width}"
            );
            assert_eq!(lit_extent(&canvas), expected, "width {width}");
        }
    }

    #[test]
    fn tensor_is_normalised_to_unit_range() {
        let preprocessor = Preprocessor::default();
        let mut gray = GrayImage::new(224, 224);
        gray.put_pixel(5, 7, Luma([255]));

        let tensor = preprocessor.to_tensor(&gray);
        assert_eq!(tensor.dim(), (1, 1, 224, 224));
        assert_abs_diff_eq!(tensor[[0, 0, 7, 5]], 1.0);
        assert_abs_diff_eq!(tensor[[0, 0, 0, 0]], -1.0);
    }

    #[test]
    fn luma_uses_rec601_weights() {
        let rgb = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let gray = to_luma(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(gray.get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn any_size_maps_to_target() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(31, 97, Rgb([10, 20, 30])));
        let tensor = Preprocessor::default().process(&img);
        assert_eq!(tensor.dim(), (1, 1, 224, 224));
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn decodes_png_bytes() {
        let gray = GrayImage::from_pixel(10, 10, Luma([128]));
        let mut bytes = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();

        let tensor = Preprocessor::new(32).from_bytes(bytes.get_ref()).unwrap();
        assert_eq!(tensor.dim(), (1, 1, 32, 32));
    }
}
