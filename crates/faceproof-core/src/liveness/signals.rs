//! Independent single-frame liveness signals.
//!
//! Every scorer maps pixels to [0, 1] and is deterministic for identical
//! input. Scorers work on the face region except `compression`, which looks
//! at the whole frame.

use crate::buffer::ImageBuffer;
use crate::plane::{
    band_score, mean, mean_variance, saturate, Plane, GAUSSIAN_3, HIGH_PASS, LAPLACIAN_4,
    LAPLACIAN_8, SOBEL_X, SOBEL_Y,
};
use crate::types::unit;
use image::{imageops, GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::template_matching::{match_template, MatchTemplateMethod};

/// All raw signals for one face, before weighting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalScores {
    pub texture: f32,
    pub edge: f32,
    pub color: f32,
    pub reflection: f32,
    pub frequency: f32,
    pub structure: f32,
    pub compression: f32,
    pub micro_movement: f32,
    pub brightness_quality: f32,
    pub lbp: f32,
    pub symmetry: f32,
    pub depth: f32,
    pub skin_ratio: f32,
    pub lighting_consistency: f32,
}

impl SignalScores {
    pub fn compute(face: &ImageBuffer, full: &ImageBuffer) -> Self {
        let gray = face.to_gray();
        let plane = Plane::from_gray(&gray);
        let full_plane = Plane::from_gray(&full.to_gray());

        let (color, skin_ratio) = color(face.rgb());
        let (reflection, lighting_consistency) = reflection(&plane);
        let symmetry = symmetry(&gray);
        let depth = depth(&plane);

        Self {
            texture: texture(&plane),
            edge: edge(&gray, &plane),
            color,
            reflection,
            frequency: frequency(&plane),
            structure: unit(0.5 * symmetry + 0.5 * depth),
            compression: compression(&full_plane),
            micro_movement: micro_movement(&plane),
            brightness_quality: brightness_quality(&plane),
            lbp: lbp(&plane),
            symmetry,
            depth,
            skin_ratio,
            lighting_consistency,
        }
    }
}

/// Mean local (8×8) standard deviation, damped for dark frames so that
/// sensor noise in underexposed images does not read as skin texture.
pub fn texture(plane: &Plane) -> f32 {
    let mut stds = Vec::new();
    for y in (0..plane.height).step_by(8) {
        for x in (0..plane.width).step_by(8) {
            stds.push(plane.region(x, y, 8, 8).variance().sqrt() as f32);
        }
    }
    let mut score = (mean(&stds) / 32.0).min(1.0);

    let brightness = plane.mean();
    if brightness < 100.0 {
        score *= (brightness / 100.0).powf(1.5);
    }
    unit(score as f32)
}

/// Canny density, LoG density and edge-orientation spread.
pub fn edge(gray: &GrayImage, plane: &Plane) -> f32 {
    if plane.is_empty() {
        return 0.0;
    }
    let total = plane.len() as f64;

    let edges = canny(gray, 50.0, 150.0);
    let density = edges.as_raw().iter().filter(|&&p| p > 0).count() as f64 / total;

    let log = plane.convolve3(&GAUSSIAN_3).convolve3(&LAPLACIAN_4);
    let log_density = log.data.iter().filter(|v| v.abs() > 8.0).count() as f64 / total;

    let gx = plane.convolve3(&SOBEL_X);
    let gy = plane.convolve3(&SOBEL_Y);
    let spread = orientation_variance(&gx, &gy);

    unit((0.4 * (density / 0.15).min(1.0) + 0.3 * (log_density / 0.2).min(1.0) + 0.3 * spread) as f32)
}

/// Circular variance of gradient orientation (angles doubled so that
/// opposite gradients along one edge count as the same orientation).
fn orientation_variance(gx: &Plane, gy: &Plane) -> f64 {
    let (mut c, mut s, mut n) = (0.0f64, 0.0f64, 0usize);
    for (&x, &y) in gx.data.iter().zip(&gy.data) {
        if (x * x + y * y).sqrt() < 20.0 {
            continue;
        }
        let theta = 2.0 * (y as f64).atan2(x as f64);
        c += theta.cos();
        s += theta.sin();
        n += 1;
    }
    if n == 0 {
        return 0.0;
    }
    1.0 - (c * c + s * s).sqrt() / n as f64
}

/// HSV spread, LAB spread and skin coverage. Returns `(score, skin_ratio)`.
pub fn color(rgb: &RgbImage) -> (f32, f32) {
    let n = (rgb.width() * rgb.height()) as usize;
    if n == 0 {
        return (0.0, 0.0);
    }

    let mut hsv_channels: [Vec<f32>; 3] = std::array::from_fn(|_| Vec::with_capacity(n));
    let mut lab_channels: [Vec<f32>; 3] = std::array::from_fn(|_| Vec::with_capacity(n));
    let mut skin = 0usize;

    for p in rgb.pixels() {
        let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
        for (channel, v) in hsv_channels.iter_mut().zip(to_hsv(r, g, b)) {
            channel.push(v);
        }
        for (channel, v) in lab_channels.iter_mut().zip(to_lab(r, g, b)) {
            channel.push(v);
        }

        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let cr = (r - y) * 0.713 + 128.0;
        let cb = (b - y) * 0.564 + 128.0;
        if (133.0..=173.0).contains(&cr) && (77.0..=127.0).contains(&cb) {
            skin += 1;
        }
    }

    let spread = |channels: &[Vec<f32>; 3]| -> f64 {
        channels
            .iter()
            .map(|c| mean_variance(c).1.sqrt())
            .sum::<f64>()
            / 3.0
    };
    let hsv_score = (spread(&hsv_channels) / 0.15).min(1.0);
    let lab_score = (spread(&lab_channels) / 0.1).min(1.0);

    let skin_ratio = skin as f64 / n as f64;
    let skin_score = band_score(skin_ratio, 0.3, 0.7, 0.3) as f64;

    (
        unit((0.35 * hsv_score + 0.35 * lab_score + 0.3 * skin_score) as f32),
        unit(skin_ratio as f32),
    )
}

/// HSV with every channel in [0, 1].
fn to_hsv(r: f32, g: f32, b: f32) -> [f32; 3] {
    let (r, g, b) = (r / 255.0, g / 255.0, b / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    [h, s, max]
}

/// CIE L*a*b* (D65), rescaled to [0, 1] per channel.
fn to_lab(r: f32, g: f32, b: f32) -> [f32; 3] {
    let linear = |c: f32| {
        let c = c / 255.0;
        if c <= 0.04045 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    let (r, g, b) = (linear(r), linear(g), linear(b));

    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    let f = |t: f32| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));

    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);
    [l / 100.0, (a + 128.0) / 255.0, (bb + 128.0) / 255.0]
}

/// Brightness spread, top/middle/bottom lighting consistency and shadow
/// share. Returns `(score, lighting_consistency)`.
pub fn reflection(plane: &Plane) -> (f32, f32) {
    if plane.is_empty() {
        return (0.0, 0.0);
    }
    let (brightness, variance) = mean_variance(&plane.data);
    let basic = (variance.sqrt() / 50.0).min(1.0);

    let third = (plane.height / 3).max(1);
    let bands = [
        plane.region(0, 0, plane.width, third),
        plane.region(0, third, plane.width, third),
        plane.region(0, 2 * third, plane.width, plane.height.saturating_sub(2 * third)),
    ];
    let band_means: Vec<f32> = bands
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| b.mean() as f32)
        .collect();
    let (_, band_var) = mean_variance(&band_means);

    // Brighter faces tolerate larger absolute differences between bands.
    let lo = 5.0 + brightness * 0.05;
    let hi = 60.0 + brightness * 0.5;
    let consistency = band_score(band_var, lo, hi, hi);

    let shadow_cut = brightness * 0.8;
    let shadow_ratio =
        plane.data.iter().filter(|&&p| (p as f64) < shadow_cut).count() as f64 / plane.len() as f64;
    let shadow = band_score(shadow_ratio, 0.2, 0.6, 0.2) as f64;

    (
        unit((0.4 * basic + 0.35 * consistency as f64 + 0.25 * shadow) as f32),
        unit(consistency),
    )
}

/// High-pass response energy.
pub fn frequency(plane: &Plane) -> f32 {
    unit(saturate(plane.convolve3(&HIGH_PASS).variance(), 400.0))
}

/// Normalized cross-correlation of the left half against the mirrored right half.
pub fn symmetry(gray: &GrayImage) -> f32 {
    let half = gray.width() / 2;
    if half == 0 || gray.height() == 0 {
        return 0.5;
    }
    let left = imageops::crop_imm(gray, 0, 0, half, gray.height()).to_image();
    let right = imageops::crop_imm(gray, gray.width() - half, 0, half, gray.height()).to_image();
    let energy = |img: &GrayImage| img.as_raw().iter().map(|&p| (p as u64) * (p as u64)).sum::<u64>();
    if energy(&left) == 0 || energy(&right) == 0 {
        return 0.5;
    }
    let mirrored = imageops::flip_horizontal(&right);

    let response = match_template(&left, &mirrored, MatchTemplateMethod::CrossCorrelationNormalized);
    unit(response.get_pixel(0, 0)[0])
}

/// Variance of smoothed Laplacian magnitude: relief cues from a 3-D face.
pub fn depth(plane: &Plane) -> f32 {
    let mut lap = plane.convolve3(&LAPLACIAN_8);
    lap.data.iter_mut().for_each(|v| *v = v.abs());
    unit(saturate(lap.box_blur(2).variance(), 50.0))
}

/// 8×8 block-boundary discontinuity relative to in-block gradients.
/// 1 means no visible blocking.
pub fn compression(plane: &Plane) -> f32 {
    let (w, h) = (plane.width, plane.height);
    let (mut boundary, mut n_boundary, mut inner, mut n_inner) = (0.0f64, 0usize, 0.0f64, 0usize);
    let mut accumulate = |pos: usize, d: f32| {
        if pos % 8 == 7 {
            boundary += d as f64;
            n_boundary += 1;
        } else {
            inner += d as f64;
            n_inner += 1;
        }
    };

    for y in 0..h {
        for x in 0..w.saturating_sub(1) {
            accumulate(x, (plane.data[y * w + x + 1] - plane.data[y * w + x]).abs());
        }
    }
    for y in 0..h.saturating_sub(1) {
        for x in 0..w {
            accumulate(y, (plane.data[(y + 1) * w + x] - plane.data[y * w + x]).abs());
        }
    }

    if n_boundary == 0 || n_inner == 0 {
        return 0.5;
    }
    let ratio = (boundary / n_boundary as f64) / (inner / n_inner as f64 + 1.0);
    unit((1.0 - (ratio - 1.0).max(0.0)) as f32)
}

/// Single-frame proxy for micro-movement: gradient-magnitude variance.
pub fn micro_movement(plane: &Plane) -> f32 {
    let gx = plane.convolve3(&SOBEL_X);
    let gy = plane.convolve3(&SOBEL_Y);
    let magnitude: Vec<f32> = gx
        .data
        .iter()
        .zip(&gy.data)
        .map(|(x, y)| (x * x + y * y).sqrt())
        .collect();
    unit(saturate(mean_variance(&magnitude).1, 1000.0))
}

pub fn brightness_quality(plane: &Plane) -> f32 {
    if plane.is_empty() {
        return 0.0;
    }
    band_score(plane.mean(), 80.0, 180.0, 80.0)
}

/// Share of non-uniform local binary patterns (more than two 0/1
/// transitions around the ring). Screens and prints push this up.
pub fn lbp(plane: &Plane) -> f32 {
    const RING: [(isize, isize); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];
    if plane.width < 3 || plane.height < 3 {
        return 0.0;
    }

    let (mut non_uniform, mut total) = (0usize, 0usize);
    for y in 1..plane.height as isize - 1 {
        for x in 1..plane.width as isize - 1 {
            let center = plane.at(x, y);
            let code = RING.iter().enumerate().fold(0u8, |code, (bit, (dx, dy))| {
                if plane.at(x + dx, y + dy) >= center {
                    code | (1 << bit)
                } else {
                    code
                }
            });
            if (code ^ code.rotate_left(1)).count_ones() > 2 {
                non_uniform += 1;
            }
            total += 1;
        }
    }
    unit(non_uniform as f32 / total as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn plane_from(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> (GrayImage, Plane) {
        let gray = GrayImage::from_fn(w, h, |x, y| Luma([f(x, y)]));
        let plane = Plane::from_gray(&gray);
        (gray, plane)
    }

    fn noise(x: u32, y: u32) -> u8 {
        let v = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263);
        let v = (v ^ (v >> 13)).wrapping_mul(1_274_126_177);
        60 + ((v >> 16) % 140) as u8
    }

    #[test]
    fn test_flat_region_has_no_texture_or_edges() {
        let (gray, plane) = plane_from(64, 64, |_, _| 128);
        assert_eq!(texture(&plane), 0.0);
        assert_eq!(edge(&gray, &plane), 0.0);
        assert_eq!(frequency(&plane), 0.0);
        assert_eq!(lbp(&plane), 0.0);
    }

    #[test]
    fn test_noise_scores_above_flat() {
        let (gray, plane) = plane_from(64, 64, noise);
        assert!(texture(&plane) > 0.5);
        assert!(edge(&gray, &plane) > 0.3);
        assert!(frequency(&plane) > 0.5);
        assert!(lbp(&plane) > 0.5);
    }

    #[test]
    fn test_texture_dark_penalty() {
        let (_, bright) = plane_from(64, 64, |x, y| if (x + y) % 2 == 0 { 110 } else { 150 });
        let (_, dark) = plane_from(64, 64, |x, y| if (x + y) % 2 == 0 { 10 } else { 50 });
        assert!(texture(&dark) < texture(&bright));
    }

    #[test]
    fn test_orientation_variance_single_direction() {
        // Vertical stripes: every gradient is horizontal.
        let (_, plane) = plane_from(32, 32, |x, _| if (x / 4) % 2 == 0 { 0 } else { 200 });
        let v = orientation_variance(&plane.convolve3(&SOBEL_X), &plane.convolve3(&SOBEL_Y));
        assert!(v < 0.05, "{v}");
    }

    #[test]
    fn test_skin_ratio() {
        let skin = RgbImage::from_pixel(20, 20, Rgb([200, 140, 110]));
        let (_, ratio) = color(&skin);
        assert!((ratio - 1.0).abs() < 1e-6);

        let blue = RgbImage::from_pixel(20, 20, Rgb([20, 40, 220]));
        assert_eq!(color(&blue).1, 0.0);
    }

    #[test]
    fn test_symmetry_of_mirrored_image() {
        let (gray, _) = plane_from(40, 30, |x, y| {
            let mx = x.min(39 - x);
            (mx * 5 + y * 2) as u8
        });
        assert!(symmetry(&gray) > 0.99);
    }

    #[test]
    fn test_symmetry_degenerate_is_neutral() {
        let (gray, _) = plane_from(40, 30, |_, _| 0);
        assert_eq!(symmetry(&gray), 0.5);
    }

    #[test]
    fn test_compression_detects_blocking() {
        let (_, smooth) = plane_from(64, 64, |x, y| (x * 2 + y) as u8);
        let (_, blocky) = plane_from(64, 64, |x, y| ((x / 8) * 20 + (y / 8) * 10) as u8);
        assert!(compression(&smooth) > compression(&blocky));
        assert_eq!(compression(&smooth), 1.0);
    }

    #[test]
    fn test_brightness_quality_band() {
        let (_, mid) = plane_from(16, 16, |_, _| 130);
        let (_, dark) = plane_from(16, 16, |_, _| 0);
        assert_eq!(brightness_quality(&mid), 1.0);
        assert_eq!(brightness_quality(&dark), 0.0);
    }

    #[test]
    fn test_all_signals_finite_for_extremes() {
        for v in [0u8, 255] {
            let img = ImageBuffer::from_rgb(RgbImage::from_pixel(48, 48, Rgb([v, v, v])));
            let s = SignalScores::compute(&img, &img);
            for x in [
                s.texture,
                s.edge,
                s.color,
                s.reflection,
                s.frequency,
                s.structure,
                s.compression,
                s.micro_movement,
                s.brightness_quality,
                s.lbp,
                s.symmetry,
                s.depth,
                s.skin_ratio,
                s.lighting_consistency,
            ] {
                assert!(x.is_finite() && (0.0..=1.0).contains(&x), "{s:?}");
            }
        }
    }
}
