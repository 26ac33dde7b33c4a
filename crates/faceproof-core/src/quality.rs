//! Image quality scoring.
//!
//! Blends sharpness, lighting and face placement into a single [0, 1] value
//! that feeds the adaptive match threshold and the liveness report.

use crate::buffer::ImageBuffer;
use crate::plane::{band_score, mean_variance, saturate, Plane, LAPLACIAN_4, LAPLACIAN_8, SOBEL_X, SOBEL_Y};
use crate::types::{largest_face, unit, DetectedFace};
use serde::{Deserialize, Serialize};

const SHARPNESS_WEIGHT: f32 = 0.40;
const LIGHTING_WEIGHT: f32 = 0.35;
const FACE_WEIGHT: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: f32,
    pub sharpness: f32,
    pub lighting: f32,
    /// 0 when no face was supplied.
    pub face: f32,
}

/// Overall quality of `image`, judged around the largest of `faces`.
pub fn score(image: &ImageBuffer, faces: &[DetectedFace]) -> f32 {
    assess(image, faces).score
}

pub fn assess(image: &ImageBuffer, faces: &[DetectedFace]) -> QualityReport {
    let plane = Plane::from_gray(&image.to_gray());
    if plane.is_empty() {
        return QualityReport {
            score: 0.0,
            sharpness: 0.0,
            lighting: 0.0,
            face: 0.0,
        };
    }

    let sharpness = sharpness(&plane);
    let lighting = lighting(&plane);
    let face = largest_face(faces)
        .map(|f| face_metrics(f, image.width(), image.height()))
        .unwrap_or(0.0);

    let score = unit(SHARPNESS_WEIGHT * sharpness + LIGHTING_WEIGHT * lighting + FACE_WEIGHT * face);
    tracing::debug!(score, sharpness, lighting, face, "quality assessed");

    QualityReport {
        score,
        sharpness,
        lighting,
        face,
    }
}

/// Laplacian-variance sharpness over two kernels plus gradient energy.
pub fn sharpness(plane: &Plane) -> f32 {
    let lap4 = plane.convolve3(&LAPLACIAN_4).variance();
    let lap8 = plane.convolve3(&LAPLACIAN_8).variance();

    let gx = plane.convolve3(&SOBEL_X);
    let gy = plane.convolve3(&SOBEL_Y);
    let energy: Vec<f32> = gx
        .data
        .iter()
        .zip(&gy.data)
        .map(|(x, y)| x * x + y * y)
        .collect();
    let (gradient, _) = mean_variance(&energy);

    unit(0.4 * saturate(lap4, 100.0) + 0.3 * saturate(lap8, 400.0) + 0.3 * saturate(gradient, 2000.0))
}

/// Brightness band, contrast, 3×3 regional uniformity and shadow share.
pub fn lighting(plane: &Plane) -> f32 {
    let (brightness, variance) = mean_variance(&plane.data);
    let contrast = variance.sqrt();

    let brightness_score = band_score(brightness, 80.0, 180.0, 80.0);
    let contrast_score = band_score(contrast, 30.0, 80.0, 30.0);

    let cell_w = (plane.width / 3).max(1);
    let cell_h = (plane.height / 3).max(1);
    let mut cell_means = Vec::with_capacity(9);
    for gy in 0..3 {
        for gx in 0..3 {
            let cell = plane.region(gx * cell_w, gy * cell_h, cell_w, cell_h);
            if !cell.is_empty() {
                cell_means.push(cell.mean() as f32);
            }
        }
    }
    let (cells_mean, cells_var) = mean_variance(&cell_means);
    let uniformity = if cells_mean > 0.0 {
        let cv = cells_var.sqrt() / cells_mean;
        (1.0 - cv / 0.5).clamp(0.0, 1.0) as f32
    } else {
        0.0
    };

    let dark = plane.data.iter().filter(|&&p| p < 50.0).count() as f64 / plane.len() as f64;
    let shadow_score = band_score(dark, 0.0, 0.15, 0.35);

    unit(0.35 * brightness_score + 0.25 * contrast_score + 0.2 * uniformity + 0.2 * shadow_score)
}

/// Size ratio, centering and aspect ratio of a face within the image.
pub fn face_metrics(face: &DetectedFace, width: u32, height: u32) -> f32 {
    let (w, h) = (width as f64, height as f64);
    if w <= 0.0 || h <= 0.0 || face.width <= 0.0 || face.height <= 0.0 {
        return 0.0;
    }

    let ratio = (face.area() as f64) / (w * h);
    let size = band_score(ratio, 0.05, 0.6, 0.1);

    let (cx, cy) = face.center();
    let dx = cx as f64 - w / 2.0;
    let dy = cy as f64 - h / 2.0;
    let half_diag = (w * w + h * h).sqrt() / 2.0;
    let centering = (1.0 - (dx * dx + dy * dy).sqrt() / half_diag).clamp(0.0, 1.0) as f32;

    let aspect = band_score((face.width / face.height) as f64, 0.6, 1.0, 0.4);

    unit(0.4 * size + 0.35 * centering + 0.25 * aspect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn noisy(w: u32, h: u32, seed: u32) -> ImageBuffer {
        let mut state = seed;
        ImageBuffer::from_rgb(RgbImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let v = 60 + ((state >> 16) % 140) as u8;
            Rgb([v, v, v])
        }))
    }

    fn flat(v: u8) -> ImageBuffer {
        ImageBuffer::from_rgb(RgbImage::from_pixel(120, 100, Rgb([v, v, v])))
    }

    #[test]
    fn test_noisy_sharper_than_flat() {
        let a = assess(&noisy(120, 100, 7), &[]);
        let b = assess(&flat(128), &[]);
        assert!(a.sharpness > b.sharpness);
        assert_eq!(b.sharpness, 0.0);
    }

    #[test]
    fn test_centered_face_beats_corner_face() {
        let centered = DetectedFace::new(35.0, 25.0, 50.0, 55.0, 0.9);
        let corner = DetectedFace::new(0.0, 0.0, 12.0, 30.0, 0.9);
        assert!(face_metrics(&centered, 120, 100) > face_metrics(&corner, 120, 100));
    }

    #[test]
    fn test_face_term_zero_without_faces() {
        assert_eq!(assess(&noisy(64, 64, 1), &[]).face, 0.0);
    }

    #[test]
    fn test_degenerate_images_stay_in_range() {
        for img in [flat(0), flat(255)] {
            let r = assess(&img, &[DetectedFace::new(10.0, 10.0, 50.0, 50.0, 0.9)]);
            for v in [r.score, r.sharpness, r.lighting, r.face] {
                assert!(v.is_finite() && (0.0..=1.0).contains(&v), "{r:?}");
            }
        }
    }

    #[test]
    fn test_dark_image_lights_poorly() {
        assert!(lighting(&Plane::from_gray(&flat(10).to_gray())) < lighting(&Plane::from_gray(&noisy(120, 100, 3).to_gray())));
    }

    #[test]
    fn test_deterministic() {
        let img = noisy(90, 70, 11);
        let face = [DetectedFace::new(20.0, 10.0, 40.0, 45.0, 0.9)];
        assert_eq!(score(&img, &face).to_bits(), score(&img, &face).to_bits());
    }
}
