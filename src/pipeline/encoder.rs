use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;

use crate::models::job::Role;
use crate::pipeline::planner::{CropRect, Variant};

/// JPEG quality applied to every derived variant.
const JPEG_QUALITY: u8 = 80;

/// One encoded artifact ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedVariant {
    /// Deterministic file name, e.g. `cover-c(705050).jpg`.
    pub key: String,
    pub role: Role,
    pub variant: Variant,
    pub bytes: Vec<u8>,
}

/// Decode raw fetched bytes into pixels.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, EncodeError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Crop (or keep whole) and compress to JPEG. Deterministic for
/// identical pixels: quality is fixed and the encoder takes no
/// time-dependent input.
pub fn encode_crop(img: &DynamicImage, rect: Option<CropRect>) -> Result<Vec<u8>, EncodeError> {
    let cropped = match rect {
        Some(r) => img.crop_imm(r.left, r.top, r.width, r.height),
        None => img.clone(),
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(cropped.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?;
    Ok(out.into_inner())
}

/// File name of a source locator without its extension:
/// `https://cdn.example.com/queue/cover.png` → `cover`.
pub fn source_basename(url: &str) -> String {
    let file = url.rsplit('/').next().unwrap_or(url);
    let file = file.split(['?', '#']).next().unwrap_or(file);
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file.to_string(),
    }
}

/// Build the deterministic output key for a variant. Encoding the same
/// (source, role, variant, dimensions, color) tuple always produces the
/// same key, so retried uploads overwrite instead of duplicating.
///
/// Grammar:
/// - thumbnail / product wide:  `{base}-c({color}).jpg`
/// - product tight:             `{base}-c({color})-p.jpg`
/// - description tile:          `{base}-w({w})-h({h})[-d({part}-{total})].jpg`
/// - watermark passthrough:     `{base}.jpg`
///
/// The color segment is dropped when extraction failed.
pub fn variant_key(
    base: &str,
    variant: Variant,
    source_width: u32,
    source_height: u32,
    color: Option<&str>,
) -> String {
    let color_tag = color.map(|c| format!("-c({c})")).unwrap_or_default();
    match variant {
        Variant::Thumbnail | Variant::Wide => format!("{base}{color_tag}.jpg"),
        Variant::Tight => format!("{base}{color_tag}-p.jpg"),
        Variant::Tile { part, total } => {
            let mut key = format!("{base}-w({source_width})-h({source_height})");
            if total > 1 {
                key.push_str(&format!("-d({part}-{total})"));
            }
            key.push_str(".jpg");
            key
        }
        Variant::Passthrough => format!("{base}.jpg"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("image operation failed: {0}")]
    Image(#[from] image::ImageError),
}
