//! Single-channel float plane and the small set of filters the quality and
//! liveness scorers share.
//!
//! All reductions iterate in row-major order with f64 accumulators so the
//! same pixels always produce bit-identical statistics.

use image::GrayImage;

pub const LAPLACIAN_4: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];
pub const LAPLACIAN_8: [f32; 9] = [1.0, 1.0, 1.0, 1.0, -8.0, 1.0, 1.0, 1.0, 1.0];
pub const SOBEL_X: [f32; 9] = [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0];
pub const SOBEL_Y: [f32; 9] = [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0];
pub const GAUSSIAN_3: [f32; 9] = [
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    4.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
];
pub const HIGH_PASS: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];

#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Pixel with replicate-border addressing.
    #[inline]
    pub fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    /// 3×3 convolution with replicate borders.
    pub fn convolve3(&self, kernel: &[f32; 9]) -> Plane {
        let mut out = Plane::new(self.width, self.height);
        if self.is_empty() {
            return out;
        }
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                let mut acc = 0.0f32;
                for ky in 0..3isize {
                    for kx in 0..3isize {
                        acc += kernel[(ky * 3 + kx) as usize] * self.at(x + kx - 1, y + ky - 1);
                    }
                }
                out.data[y as usize * self.width + x as usize] = acc;
            }
        }
        out
    }

    /// Box blur with a `(2r+1)²` window, replicate borders.
    pub fn box_blur(&self, radius: usize) -> Plane {
        let mut out = Plane::new(self.width, self.height);
        if self.is_empty() {
            return out;
        }
        let r = radius as isize;
        let area = ((2 * r + 1) * (2 * r + 1)) as f32;
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                let mut acc = 0.0f32;
                for dy in -r..=r {
                    for dx in -r..=r {
                        acc += self.at(x + dx, y + dy);
                    }
                }
                out.data[y as usize * self.width + x as usize] = acc / area;
            }
        }
        out
    }

    /// Horizontally mirrored copy.
    pub fn flipped(&self) -> Plane {
        let mut out = Plane::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                out.data[y * self.width + x] = self.data[y * self.width + (self.width - 1 - x)];
            }
        }
        out
    }

    /// Copy of the sub-rectangle `[x0, x0+w) × [y0, y0+h)`, clipped to the plane.
    pub fn region(&self, x0: usize, y0: usize, w: usize, h: usize) -> Plane {
        let x1 = (x0 + w).min(self.width);
        let y1 = (y0 + h).min(self.height);
        let (x0, y0) = (x0.min(x1), y0.min(y1));
        let mut out = Plane::new(x1 - x0, y1 - y0);
        for y in y0..y1 {
            let src = &self.data[y * self.width + x0..y * self.width + x1];
            out.data[(y - y0) * out.width..(y - y0 + 1) * out.width].copy_from_slice(src);
        }
        out
    }

    pub fn mean(&self) -> f64 {
        mean(&self.data)
    }

    pub fn variance(&self) -> f64 {
        mean_variance(&self.data).1
    }
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

/// Population mean and variance; (0, 0) for an empty slice.
pub fn mean_variance(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let m = mean(values);
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - m;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    (m, var)
}

/// Saturating map of a non-negative statistic to [0, 1): `v / (v + k)`.
pub fn saturate(value: f64, half_point: f64) -> f32 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }
    (value / (value + half_point)) as f32
}

/// Triangular band score: 1 inside `[lo, hi]`, falling linearly to 0 at
/// `lo - falloff` and `hi + falloff`.
pub fn band_score(value: f64, lo: f64, hi: f64, falloff: f64) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    let score = if value < lo {
        1.0 - (lo - value) / falloff
    } else if value > hi {
        1.0 - (value - hi) / falloff
    } else {
        1.0
    };
    score.clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: usize, h: usize) -> Plane {
        Plane {
            width: w,
            height: h,
            data: (0..w * h).map(|i| (i % w) as f32 * 10.0).collect(),
        }
    }

    #[test]
    fn test_laplacian_of_constant_is_zero() {
        let p = Plane {
            width: 8,
            height: 8,
            data: vec![77.0; 64],
        };
        let lap = p.convolve3(&LAPLACIAN_8);
        assert!(lap.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_laplacian_of_linear_ramp_is_zero_inside() {
        let lap = ramp(10, 6).convolve3(&LAPLACIAN_4);
        for y in 1..5 {
            for x in 1..9 {
                assert_eq!(lap.data[y * 10 + x], 0.0);
            }
        }
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let p = ramp(7, 3);
        assert_eq!(p.flipped().flipped(), p);
        assert_eq!(p.flipped().data[0], 60.0);
    }

    #[test]
    fn test_region_clipped() {
        let p = ramp(10, 10);
        let r = p.region(8, 8, 5, 5);
        assert_eq!((r.width, r.height), (2, 2));
        assert_eq!(r.data[0], 80.0);
    }

    #[test]
    fn test_mean_variance() {
        let (m, v) = mean_variance(&[1.0, 3.0]);
        assert!((m - 2.0).abs() < 1e-12);
        assert!((v - 1.0).abs() < 1e-12);
        assert_eq!(mean_variance(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_band_score() {
        assert_eq!(band_score(0.5, 0.3, 0.7, 0.3), 1.0);
        assert!((band_score(0.15, 0.3, 0.7, 0.3) - 0.5).abs() < 1e-6);
        assert_eq!(band_score(1.5, 0.3, 0.7, 0.3), 0.0);
        assert_eq!(band_score(f64::NAN, 0.3, 0.7, 0.3), 0.0);
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(0.0, 10.0), 0.0);
        assert!((saturate(10.0, 10.0) - 0.5).abs() < 1e-6);
        assert_eq!(saturate(f64::INFINITY, 10.0), 0.0);
    }
}
