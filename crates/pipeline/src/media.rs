//! Media classification and image renditions.

use std::io::Cursor;

use fleet_core::status::AttachmentKind;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView};

/// Longest side of the preview rendition.
pub const PREVIEW_MAX_SIDE: u32 = 512;
pub const PREVIEW_QUALITY: u8 = 75;

/// Longest side of the high rendition.
pub const HIGH_MAX_SIDE: u32 = 2048;
pub const HIGH_QUALITY: u8 = 90;

/// Sniffed media type of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: AttachmentKind,
    /// File extension without the dot.
    pub extension: String,
}

/// Classify by magic bytes. Unknown content is a `bin` file.
pub fn classify(bytes: &[u8]) -> Classified {
    match infer::get(bytes) {
        Some(t) => {
            let kind = match t.matcher_type() {
                infer::MatcherType::Image => AttachmentKind::Image,
                infer::MatcherType::Video => AttachmentKind::Video,
                _ => AttachmentKind::File,
            };
            Classified {
                kind,
                extension: t.extension().to_string(),
            }
        }
        None => Classified {
            kind: AttachmentKind::File,
            extension: "bin".to_string(),
        },
    }
}

/// Width over height.
pub fn aspect_ratio(width: u32, height: u32) -> Option<f64> {
    (height > 0).then(|| width as f64 / height as f64)
}

/// Encode `img` as JPEG, downscaled so its longest side is at most
/// `max_side`. Smaller images keep their size.
pub fn render_jpeg(img: &DynamicImage, max_side: u32, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let (w, h) = img.dimensions();
    let scaled;
    let source = if w > max_side || h > max_side {
        scaled = img.resize(max_side, max_side, image::imageops::FilterType::Lanczos3);
        &scaled
    } else {
        img
    };

    // JPEG has no alpha channel.
    let rgb = source.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

/// Decoded image plus its renditions. A rendition that failed to encode is
/// `None`.
pub struct Renditions {
    pub ratio: Option<f64>,
    pub preview: Option<Vec<u8>>,
    pub high: Option<Vec<u8>>,
}

/// Decode `bytes` and render preview and high JPEGs.
///
/// Returns `Err` only when the bytes cannot be decoded at all.
pub fn render_renditions(bytes: &[u8]) -> Result<Renditions, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = img.dimensions();

    let preview = render_jpeg(&img, PREVIEW_MAX_SIDE, PREVIEW_QUALITY)
        .map_err(|e| tracing::warn!(error = %e, "Preview rendition failed"))
        .ok();
    let high = render_jpeg(&img, HIGH_MAX_SIDE, HIGH_QUALITY)
        .map_err(|e| tracing::warn!(error = %e, "High rendition failed"))
        .ok();

    Ok(Renditions {
        ratio: aspect_ratio(w, h),
        preview,
        high,
    })
}
