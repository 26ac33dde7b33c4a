//! Decoded pixel matrix and bounds-checked region access.

use crate::types::DetectedFace;
use image::{imageops, DynamicImage, GrayImage, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region {x},{y} {width}x{height} lies outside {image_width}x{image_height} image")]
    OutOfBounds {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        image_width: u32,
        image_height: u32,
    },
}

/// An RGB image owned by the request that decoded it.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    rgb: RgbImage,
}

impl ImageBuffer {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn from_dynamic(img: DynamicImage) -> Self {
        Self { rgb: img.into_rgb8() }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn channels(&self) -> u8 {
        3
    }

    /// Row-major interleaved RGB bytes.
    pub fn as_raw(&self) -> &[u8] {
        self.rgb.as_raw()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Luma copy (ITU-R 601 weights, as computed by the `image` crate).
    pub fn to_gray(&self) -> GrayImage {
        imageops::grayscale(&self.rgb)
    }

    /// Downscale in place so that the image fits within `max_w × max_h`,
    /// preserving aspect ratio and never shrinking the shorter side below `floor`.
    ///
    /// Returns true if the image was resized.
    pub fn downscale_to_fit(&mut self, max_w: u32, max_h: u32, floor: u32) -> bool {
        let (w, h) = (self.width(), self.height());
        if w <= max_w && h <= max_h {
            return false;
        }
        let scale = (max_w as f32 / w as f32).min(max_h as f32 / h as f32);
        let min_side = w.min(h) as f32;
        let scale = if min_side * scale < floor as f32 {
            (floor as f32 / min_side).min(1.0)
        } else {
            scale
        };
        let new_w = ((w as f32 * scale).round() as u32).max(1);
        let new_h = ((h as f32 * scale).round() as u32).max(1);
        if new_w == w && new_h == h {
            return false;
        }
        tracing::debug!(from_w = w, from_h = h, to_w = new_w, to_h = new_h, "downscaling image");
        self.rgb = imageops::resize(&self.rgb, new_w, new_h, imageops::FilterType::Triangle);
        true
    }

    /// Copy the face region out of the image.
    ///
    /// The box is validated against the image bounds before any pixel is read.
    pub fn crop(&self, face: &DetectedFace) -> Result<ImageBuffer, RegionError> {
        let out_of_bounds = || RegionError::OutOfBounds {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
            image_width: self.width(),
            image_height: self.height(),
        };
        let clamped = face
            .clone()
            .clamp_to(self.width(), self.height())
            .ok_or_else(out_of_bounds)?;

        let x = clamped.x.floor() as u32;
        let y = clamped.y.floor() as u32;
        let w = (clamped.width.round() as u32).clamp(1, self.width() - x);
        let h = (clamped.height.round() as u32).clamp(1, self.height() - y);

        let view = imageops::crop_imm(&self.rgb, x, y, w, h);
        Ok(ImageBuffer {
            rgb: view.to_image(),
        })
    }

    /// Crop with a relative margin around the box, clipped to the image.
    pub fn crop_with_margin(
        &self,
        face: &DetectedFace,
        margin: f32,
    ) -> Result<ImageBuffer, RegionError> {
        let mx = face.width * margin;
        let my = face.height * margin;
        let padded = DetectedFace {
            x: face.x - mx,
            y: face.y - my,
            width: face.width + 2.0 * mx,
            height: face.height + 2.0 * my,
            ..face.clone()
        };
        self.crop(&padded)
    }

    /// Resize to an exact size (used for fixed-input recognizers).
    pub fn resized(&self, width: u32, height: u32) -> ImageBuffer {
        ImageBuffer {
            rgb: imageops::resize(&self.rgb, width, height, imageops::FilterType::Triangle),
        }
    }
}
