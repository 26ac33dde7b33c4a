//! Image ingestion: classify the input, decode inline payloads, and
//! validate + normalize decoded bytes into an [`ImageBuffer`].
//!
//! URL downloads happen in the service layer; the bytes they yield come back
//! through [`decode_bytes`] so both paths share the same validation.

use crate::buffer::ImageBuffer;
use crate::error::FailureReason;
use base64::Engine as _;
use image::{ImageError, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

// --- Input limits ---
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;
pub const MIN_INLINE_LEN: usize = 100;
pub const MIN_DIMENSION: u32 = 32;
pub const MAX_DIMENSION: u32 = 10_000;
pub const MIN_ASPECT_RATIO: f32 = 0.1;
pub const MAX_ASPECT_RATIO: f32 = 10.0;

// --- Working-size normalization ---
pub const WORKING_MAX_WIDTH: u32 = 800;
pub const WORKING_MAX_HEIGHT: u32 = 600;
pub const WORKING_MIN_SIDE: u32 = 200;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("empty image input")]
    EmptyInput,
    #[error("inline image payload too short ({0} chars)")]
    InlineTooShort(usize),
    #[error("malformed data URL")]
    InvalidDataUrl,
    #[error("base64 length {0} is not a multiple of 4")]
    InvalidBase64Length(usize),
    #[error("invalid base64 character {ch:?} at position {position}")]
    InvalidBase64Char { position: usize, ch: char },
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("URL too long ({0} chars)")]
    UrlTooLong(usize),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("URL host not allowed: {0}")]
    BlockedHost(String),
    #[error("download failed: {0}")]
    Network(String),
    #[error("download timed out")]
    DownloadTimeout,
    #[error("download returned HTTP {0}")]
    HttpStatus(u16),
    #[error("response is not an image (content-type {0:?})")]
    NotAnImage(String),
    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupted image: {0}")]
    Corrupted(String),
    #[error("image {width}x{height} is smaller than {MIN_DIMENSION}x{MIN_DIMENSION}")]
    DimensionsTooSmall { width: u32, height: u32 },
    #[error("image {width}x{height} is larger than {MAX_DIMENSION}x{MAX_DIMENSION}")]
    DimensionsTooLarge { width: u32, height: u32 },
    #[error("degenerate aspect ratio {0:.3}")]
    DegenerateAspect(f32),
}

impl LoadError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::EmptyInput
            | Self::InlineTooShort(_)
            | Self::InvalidDataUrl
            | Self::InvalidBase64Length(_)
            | Self::InvalidBase64Char { .. }
            | Self::Base64(_)
            | Self::UrlTooLong(_)
            | Self::InvalidUrl(_)
            | Self::UnsupportedScheme(_)
            | Self::BlockedHost(_)
            | Self::DegenerateAspect(_) => FailureReason::Validation,
            Self::Network(_) | Self::DownloadTimeout | Self::HttpStatus(_) => {
                FailureReason::NetworkError
            }
            Self::NotAnImage(_) | Self::UnsupportedFormat(_) => {
                FailureReason::UnsupportedImageFormat
            }
            Self::TooLarge { .. } | Self::DimensionsTooLarge { .. } => FailureReason::ImageTooLarge,
            Self::DimensionsTooSmall { .. } => FailureReason::ImageTooSmall,
            Self::Corrupted(_) => FailureReason::CorruptedImage,
        }
    }
}

/// Where an image input string points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource<'a> {
    /// An http(s) URL, still to be policy-checked and downloaded.
    Url(&'a str),
    /// A data URL or bare base64 payload.
    Inline(&'a str),
}

impl<'a> ImageSource<'a> {
    pub fn classify(input: &'a str) -> Result<Self, LoadError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(LoadError::EmptyInput);
        }
        let lower_prefix: String = input.chars().take(8).collect::<String>().to_ascii_lowercase();
        if lower_prefix.starts_with("http://") || lower_prefix.starts_with("https://") {
            return Ok(Self::Url(input));
        }
        if let Some((scheme, _)) = input.split_once("://") {
            if !scheme.is_empty() && scheme.len() <= 16 && scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(LoadError::UnsupportedScheme(scheme.to_string()));
            }
        }
        Ok(Self::Inline(input))
    }
}

/// Decode a data URL (`data:image/png;base64,...`) or bare base64 payload.
///
/// Shape checks run before any decoding is attempted.
pub fn decode_inline(input: &str) -> Result<Vec<u8>, LoadError> {
    let input = input.trim();
    if input.len() < MIN_INLINE_LEN {
        return Err(LoadError::InlineTooShort(input.len()));
    }

    let payload = if input.starts_with("data:") {
        let parts: Vec<&str> = input.split(',').collect();
        if parts.len() != 2 || !parts[0].ends_with(";base64") {
            return Err(LoadError::InvalidDataUrl);
        }
        parts[1]
    } else {
        input
    };

    if payload.len() % 4 != 0 {
        return Err(LoadError::InvalidBase64Length(payload.len()));
    }
    check_base64_alphabet(payload)?;

    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(LoadError::TooLarge {
            limit: MAX_IMAGE_BYTES,
        });
    }
    Ok(bytes)
}

/// Standard alphabet, with at most two trailing `=` pad characters.
fn check_base64_alphabet(payload: &str) -> Result<(), LoadError> {
    let body_len = payload.trim_end_matches('=').len();
    if payload.len() - body_len > 2 {
        return Err(LoadError::InvalidBase64Char {
            position: body_len,
            ch: '=',
        });
    }
    for (position, ch) in payload[..body_len].char_indices() {
        if !(ch.is_ascii_alphanumeric() || ch == '+' || ch == '/') {
            return Err(LoadError::InvalidBase64Char { position, ch });
        }
    }
    Ok(())
}

/// Validate, decode and normalize encoded image bytes.
pub fn decode_bytes(bytes: &[u8]) -> Result<ImageBuffer, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::Corrupted("empty payload".into()));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(LoadError::TooLarge {
            limit: MAX_IMAGE_BYTES,
        });
    }

    let format = image::guess_format(bytes)
        .map_err(|_| LoadError::UnsupportedFormat("unrecognized".into()))?;
    if !matches!(
        format,
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp | ImageFormat::WebP
    ) {
        return Err(LoadError::UnsupportedFormat(format!("{format:?}").to_lowercase()));
    }

    // Header-only probe so oversized images are rejected before allocation.
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(map_image_error)?;
    validate_dimensions(width, height)?;

    let decoded = image::load_from_memory_with_format(bytes, format).map_err(map_image_error)?;
    let mut buffer = ImageBuffer::from_dynamic(decoded);
    buffer.downscale_to_fit(WORKING_MAX_WIDTH, WORKING_MAX_HEIGHT, WORKING_MIN_SIDE);

    tracing::debug!(
        format = ?format,
        original_width = width,
        original_height = height,
        width = buffer.width(),
        height = buffer.height(),
        "image decoded"
    );
    Ok(buffer)
}

/// Reject images outside the accepted size and aspect-ratio envelope.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), LoadError> {
    if width < MIN_DIMENSION || height < MIN_DIMENSION {
        return Err(LoadError::DimensionsTooSmall { width, height });
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(LoadError::DimensionsTooLarge { width, height });
    }
    let aspect = width as f32 / height as f32;
    if !(MIN_ASPECT_RATIO..=MAX_ASPECT_RATIO).contains(&aspect) {
        return Err(LoadError::DegenerateAspect(aspect));
    }
    Ok(())
}

fn map_image_error(err: ImageError) -> LoadError {
    match err {
        ImageError::Unsupported(e) => LoadError::UnsupportedFormat(e.to_string()),
        ImageError::Limits(_) => LoadError::TooLarge {
            limit: MAX_IMAGE_BYTES,
        },
        other => LoadError::Corrupted(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut out, format)
            .unwrap();
        out.into_inner()
    }

    fn data_url(bytes: &[u8]) -> String {
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    #[test]
    fn test_classify_sources() {
        assert_eq!(
            ImageSource::classify("https://example.com/a.jpg").unwrap(),
            ImageSource::Url("https://example.com/a.jpg")
        );
        assert!(matches!(
            ImageSource::classify("data:image/png;base64,AAAA").unwrap(),
            ImageSource::Inline(_)
        ));
        assert!(matches!(
            ImageSource::classify("ftp://example.com/a.jpg"),
            Err(LoadError::UnsupportedScheme(_))
        ));
        assert!(matches!(ImageSource::classify("   "), Err(LoadError::EmptyInput)));
    }

    #[test]
    fn test_inline_too_short() {
        let err = decode_inline("data:image/png;base64,AAAA").unwrap_err();
        assert!(matches!(err, LoadError::InlineTooShort(_)));
        assert_eq!(err.reason(), FailureReason::Validation);
    }

    #[test]
    fn test_inline_bad_length_rejected_before_decode() {
        let payload = "A".repeat(121);
        let err = decode_inline(&payload).unwrap_err();
        assert!(matches!(err, LoadError::InvalidBase64Length(121)));
        assert_eq!(err.reason(), FailureReason::Validation);
    }

    #[test]
    fn test_inline_bad_alphabet() {
        let mut payload = "A".repeat(120);
        payload.replace_range(10..11, "*");
        let err = decode_inline(&payload).unwrap_err();
        assert!(matches!(err, LoadError::InvalidBase64Char { position: 10, ch: '*' }));
    }

    #[test]
    fn test_inline_data_url_needs_two_parts() {
        let payload = format!("data:image/png;base64,{},{}", "A".repeat(60), "A".repeat(60));
        assert!(matches!(decode_inline(&payload), Err(LoadError::InvalidDataUrl)));
    }

    #[test]
    fn test_inline_data_url_needs_base64_marker() {
        let payload = format!("data:image/png,{}", "A".repeat(120));
        assert!(matches!(decode_inline(&payload), Err(LoadError::InvalidDataUrl)));
    }

    #[test]
    fn test_roundtrip_png_data_url() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([200, 100, 50]));
        let bytes = decode_inline(&data_url(&encode(&img, ImageFormat::Png))).unwrap();
        let buffer = decode_bytes(&bytes).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (64, 48));
    }

    #[test]
    fn test_decode_downscales_large_images() {
        let img = RgbImage::from_pixel(1200, 900, image::Rgb([90, 90, 90]));
        let buffer = decode_bytes(&encode(&img, ImageFormat::Png)).unwrap();
        assert_eq!((buffer.width(), buffer.height()), (800, 600));
    }

    #[test]
    fn test_decode_too_small() {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([0, 0, 0]));
        let err = decode_bytes(&encode(&img, ImageFormat::Png)).unwrap_err();
        assert_eq!(err.reason(), FailureReason::ImageTooSmall);
    }

    #[test]
    fn test_decode_degenerate_aspect() {
        let img = RgbImage::from_pixel(400, 35, image::Rgb([0, 0, 0]));
        let err = decode_bytes(&encode(&img, ImageFormat::Png)).unwrap_err();
        assert!(matches!(err, LoadError::DegenerateAspect(_)));
    }

    #[test]
    fn test_decode_unsupported_format() {
        let img = RgbImage::from_pixel(64, 64, image::Rgb([0, 0, 0]));
        let err = decode_bytes(&encode(&img, ImageFormat::Tiff)).unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnsupportedImageFormat);
    }

    #[test]
    fn test_decode_truncated_png_is_corrupted() {
        let img = RgbImage::from_pixel(64, 64, image::Rgb([1, 2, 3]));
        let mut bytes = encode(&img, ImageFormat::Png);
        bytes.truncate(bytes.len() / 2);
        let err = decode_bytes(&bytes).unwrap_err();
        assert_eq!(err.reason(), FailureReason::CorruptedImage);
    }

    #[test]
    fn test_decode_garbage_is_unsupported() {
        let err = decode_bytes(&[0x13u8; 256]).unwrap_err();
        assert_eq!(err.reason(), FailureReason::UnsupportedImageFormat);
    }

    #[test]
    fn test_validate_dimensions_bounds() {
        assert!(validate_dimensions(32, 32).is_ok());
        assert!(validate_dimensions(10_000, 10_000).is_ok());
        assert!(validate_dimensions(10_001, 5000).is_err());
        assert!(validate_dimensions(31, 100).is_err());
    }
}
