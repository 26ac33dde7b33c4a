//! Landmark alignment to the canonical 112×112 ArcFace crop.

use crate::buffer::ImageBuffer;
use crate::types::Landmarks;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// InsightFace reference positions for a 112×112 crop, in landmark order.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// Scale + rotation + translation: `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `src` onto `dst` (closed form on centered
    /// points). Coincident source points give the identity.
    pub fn estimate(src: &Landmarks, dst: &Landmarks) -> Self {
        let n = src.len() as f64;
        let centroid = |pts: &Landmarks| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0f64, 0.0f64), |(x, y), p| (x + p.0 as f64, y + p.1 as f64));
            (sx / n, sy / n)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f64, 0.0f64, 0.0f64);
        for (s, d) in src.iter().zip(dst) {
            let (px, py) = (s.0 as f64 - scx, s.1 as f64 - scy);
            let (qx, qy) = (d.0 as f64 - dcx, d.1 as f64 - dcy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            norm += px * px + py * py;
        }
        if norm < 1e-9 {
            return Self::IDENTITY;
        }

        let (a, b) = (dot / norm, cross / norm);
        Self {
            a: a as f32,
            b: b as f32,
            tx: (dcx - (a * scx - b * scy)) as f32,
            ty: (dcy - (b * scx + a * scy)) as f32,
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }
}

/// Warp the face so its landmarks sit on the reference positions.
/// Samples falling outside the source are black.
pub fn align_face(image: &ImageBuffer, landmarks: &Landmarks) -> ImageBuffer {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    match transform.projection() {
        Some(projection) => warp_into(
            image.rgb(),
            &projection,
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
            &mut out,
        ),
        None => tracing::warn!(?transform, "singular alignment transform"),
    }
    ImageBuffer::from_rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!(close(t.a, 1.0, 1e-4) && close(t.b, 0.0, 1e-4));
        assert!(close(t.tx, 0.0, 1e-3) && close(t.ty, 0.0, 1e-3));
    }

    #[test]
    fn test_half_scale_fit() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!(close(t.a, 0.5, 1e-3), "a = {}", t.a);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!(close(x, d.0, 0.01) && close(y, d.1, 0.01));
        }
    }

    #[test]
    fn test_rotation_fit() {
        let (c, s) = (30f32.to_radians().cos(), 30f32.to_radians().sin());
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (c * x - s * y, s * x + c * y));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!(close(t.a, c, 1e-3) && close(t.b, -s, 1e-3));
    }

    #[test]
    fn test_coincident_points_give_identity() {
        let t = Similarity::estimate(&[(10.0, 10.0); 5], &REFERENCE_LANDMARKS_112);
        assert_eq!(t, Similarity::IDENTITY);
    }

    #[test]
    fn test_aligned_size() {
        let img = ImageBuffer::from_rgb(RgbImage::from_pixel(64, 48, Rgb([128, 128, 128])));
        let aligned = align_face(&img, &REFERENCE_LANDMARKS_112);
        assert_eq!((aligned.width(), aligned.height()), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_left_eye_lands_on_reference() {
        let mut frame = RgbImage::new(200, 200);
        let landmarks: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for y in 57..64 {
            for x in 77..84 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&ImageBuffer::from_rgb(frame), &landmarks);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.rgb().get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(peak > 100, "peak {peak} near ({rx}, {ry})");
    }
}
