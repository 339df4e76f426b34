//! Image preprocessing for the vision tower.
//!
//! Mirrors the Hugging Face CLIP/SigLIP processors: optional pad-to-square,
//! resize, centre crop, rescale to `[0, 1]` and per-channel normalisation.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use super::vision::{VisionEncoderConfig, VisionEncoderType};
use super::ImageSize;
use crate::error::{Error, Result};

pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
#[allow(clippy::excessive_precision)]
pub const CLIP_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
pub const SIGLIP_IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const SIGLIP_IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// How non-square images are brought to the tower resolution
/// (`image_aspect_ratio` in the model config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectMode {
    /// Pad to a square filled with the mean colour, then resize.
    #[default]
    Pad,
    /// Resize the shortest edge and centre-crop.
    Crop,
}

impl AspectMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pad" => Ok(Self::Pad),
            "square" | "crop" | "" => Ok(Self::Crop),
            other if other.starts_with("anyres") => Err(Error::UnsupportedConfiguration(
                format!("image_aspect_ratio {other} requires multi-crop inputs"),
            )),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown image_aspect_ratio: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub aspect: AspectMode,
    /// SigLIP resizes straight to the target square instead of crop.
    pub resize_exact: bool,
}

/// A batch ready for the tower.
#[derive(Debug, Clone)]
pub struct PreprocessedImages {
    /// `[n, 3, image_size, image_size]`
    pub pixel_values: Tensor,
    pub image_sizes: Vec<ImageSize>,
}

impl ImageProcessor {
    pub fn for_tower(cfg: &VisionEncoderConfig, aspect: AspectMode) -> Self {
        match cfg.encoder_type {
            VisionEncoderType::Clip => Self {
                image_size: cfg.image_size as u32,
                mean: CLIP_IMAGE_MEAN,
                std: CLIP_IMAGE_STD,
                aspect,
                resize_exact: false,
            },
            VisionEncoderType::SigLip => Self {
                image_size: cfg.image_size as u32,
                mean: SIGLIP_IMAGE_MEAN,
                std: SIGLIP_IMAGE_STD,
                aspect,
                resize_exact: true,
            },
        }
    }

    pub fn open(&self, path: &Path) -> Result<DynamicImage> {
        image::open(path).map_err(|e| {
            Error::InvalidInput(format!("failed to open image {}: {e}", path.display()))
        })
    }

    /// Preprocess one image into `[3, H, W]` float values.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "image has zero size {width}x{height}"
            )));
        }
        let rgb = image.to_rgb8();
        let rgb = match self.aspect {
            AspectMode::Pad => expand_to_square(&rgb, self.background()),
            AspectMode::Crop => rgb,
        };
        let resized = if self.resize_exact {
            image::imageops::resize(&rgb, self.image_size, self.image_size, FilterType::CatmullRom)
        } else {
            let shortest = resize_shortest_edge(&rgb, self.image_size);
            center_crop(&shortest, self.image_size)
        };
        Ok(self.normalize(&resized))
    }

    /// Preprocess a batch of images into a single pixel tensor.
    pub fn preprocess_batch(
        &self,
        images: &[DynamicImage],
        dtype: DType,
        device: &Device,
    ) -> Result<PreprocessedImages> {
        if images.is_empty() {
            return Err(Error::InvalidInput("no images to preprocess".into()));
        }
        let side = self.image_size as usize;
        let mut data = Vec::with_capacity(images.len() * 3 * side * side);
        let mut image_sizes = Vec::with_capacity(images.len());
        for image in images {
            let (width, height) = image.dimensions();
            image_sizes.push(ImageSize { width, height });
            data.extend(self.preprocess(image)?);
        }
        let pixel_values = Tensor::from_vec(data, (images.len(), 3, side, side), device)?
            .to_dtype(dtype)?;
        tracing::debug!(
            num_images = images.len(),
            image_size = side,
            "preprocessed images"
        );
        Ok(PreprocessedImages {
            pixel_values,
            image_sizes,
        })
    }

    fn background(&self) -> Rgb<u8> {
        Rgb(self.mean.map(|m| (m * 255.0) as u8))
    }

    fn normalize(&self, rgb: &RgbImage) -> Vec<f32> {
        let (w, h) = rgb.dimensions();
        let mut data = Vec::with_capacity(3 * (w * h) as usize);
        // HWC -> CHW
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let value = rgb.get_pixel(x, y)[c] as f32 / 255.0;
                    data.push((value - self.mean[c]) / self.std[c]);
                }
            }
        }
        data
    }
}

/// Centre the image on a square canvas filled with `background`.
fn expand_to_square(rgb: &RgbImage, background: Rgb<u8>) -> RgbImage {
    let (w, h) = rgb.dimensions();
    if w == h {
        return rgb.clone();
    }
    let side = w.max(h);
    let mut canvas = RgbImage::from_pixel(side, side, background);
    let x = ((side - w) / 2) as i64;
    let y = ((side - h) / 2) as i64;
    image::imageops::overlay(&mut canvas, rgb, x, y);
    canvas
}

fn resize_shortest_edge(rgb: &RgbImage, target: u32) -> RgbImage {
    let (w, h) = rgb.dimensions();
    let (nw, nh) = if w <= h {
        (target, ((h as f64 * target as f64 / w as f64).round() as u32).max(target))
    } else {
        (((w as f64 * target as f64 / h as f64).round() as u32).max(target), target)
    };
    image::imageops::resize(rgb, nw, nh, FilterType::CatmullRom)
}

fn center_crop(rgb: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = rgb.dimensions();
    let x = w.saturating_sub(size) / 2;
    let y = h.saturating_sub(size) / 2;
    image::imageops::crop_imm(rgb, x, y, size.min(w), size.min(h)).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(px)))
    }

    #[test]
    fn aspect_mode_parse() {
        assert_eq!(AspectMode::parse("pad").unwrap(), AspectMode::Pad);
        assert_eq!(AspectMode::parse("square").unwrap(), AspectMode::Crop);
        assert!(matches!(
            AspectMode::parse("anyres"),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn expand_to_square_centres_content() {
        let rgb = RgbImage::from_pixel(4, 2, Rgb([255, 0, 0]));
        let square = expand_to_square(&rgb, Rgb([0, 0, 255]));
        assert_eq!(square.dimensions(), (4, 4));
        assert_eq!(square.get_pixel(0, 0), &Rgb([0, 0, 255]));
        assert_eq!(square.get_pixel(0, 1), &Rgb([255, 0, 0]));
        assert_eq!(square.get_pixel(3, 3), &Rgb([0, 0, 255]));
    }

    #[test]
    fn shortest_edge_then_crop_gives_square() {
        let rgb = RgbImage::from_pixel(60, 30, Rgb([1, 2, 3]));
        let resized = resize_shortest_edge(&rgb, 14);
        assert_eq!(resized.dimensions(), (28, 14));
        assert_eq!(center_crop(&resized, 14).dimensions(), (14, 14));
    }

    #[test]
    fn batch_shape_and_sizes() {
        let cfg = VisionEncoderConfig {
            image_size: 28,
            ..Default::default()
        };
        let processor = ImageProcessor::for_tower(&cfg, AspectMode::Pad);
        let images = vec![solid(40, 20, [10, 20, 30]), solid(28, 28, [0, 0, 0])];
        let batch = processor
            .preprocess_batch(&images, DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(batch.pixel_values.dims(), &[2, 3, 28, 28]);
        assert_eq!(
            batch.image_sizes,
            vec![
                ImageSize {
                    width: 40,
                    height: 20
                },
                ImageSize {
                    width: 28,
                    height: 28
                }
            ]
        );
    }

    #[test]
    fn siglip_normalisation_maps_white_to_one() {
        let processor =
            ImageProcessor::for_tower(&VisionEncoderConfig::siglip_so400m_384(), AspectMode::Crop);
        let values = processor.normalize(&RgbImage::from_pixel(2, 2, Rgb([255, 255, 255])));
        assert_eq!(values.len(), 12);
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let processor =
            ImageProcessor::for_tower(&VisionEncoderConfig::default(), AspectMode::Pad);
        assert!(processor
            .preprocess_batch(&[], DType::F32, &Device::Cpu)
            .is_err());
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        let processor =
            ImageProcessor::for_tower(&VisionEncoderConfig::default(), AspectMode::Crop);
        for image in [solid(0, 10, [1, 2, 3]), solid(10, 0, [1, 2, 3])] {
            let err = processor
                .preprocess_batch(&[solid(4, 4, [0, 0, 0]), image], DType::F32, &Device::Cpu)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{err}");
        }
    }
}
