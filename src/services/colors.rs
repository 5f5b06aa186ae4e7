use async_trait::async_trait;
use image::DynamicImage;

/// Representative-color collaborator. The returned tag is six lowercase
/// hex digits and becomes part of the variant key; failure is tolerated
/// per call, the encoder then omits the color tag.
#[async_trait]
pub trait ColorExtractor: Send + Sync {
    async fn extract(&self, data: &[u8]) -> Result<String, ColorError>;
}

/// Derives a muted representative color from the image itself: pixels
/// are downsampled, quantized into coarse RGB buckets, and buckets are
/// scored by population weighted toward mid saturation and lightness.
pub struct PaletteExtractor;

#[async_trait]
impl ColorExtractor for PaletteExtractor {
    async fn extract(&self, data: &[u8]) -> Result<String, ColorError> {
        let bytes = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&bytes)?;
            Ok(muted_hex(&img))
        })
        .await
        .map_err(|e| ColorError::Task(e.to_string()))?
    }
}

/// Quantize to 3 bits per channel and pick the best-scoring bucket.
fn muted_hex(img: &DynamicImage) -> String {
    let small = img.thumbnail(64, 64).to_rgb8();

    let mut counts = std::collections::HashMap::new();
    for pixel in small.pixels() {
        let bucket = (pixel[0] >> 5, pixel[1] >> 5, pixel[2] >> 5);
        *counts.entry(bucket).or_insert(0u32) += 1;
    }

    let best = counts
        .iter()
        .map(|(&bucket, &count)| (bucket, count as f64 * muted_weight(bucket)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(bucket, _)| bucket)
        .unwrap_or((4, 4, 4));

    // bucket center
    let (r, g, b) = (
        (best.0 << 5) | 0x10,
        (best.1 << 5) | 0x10,
        (best.2 << 5) | 0x10,
    );
    format!("{:02x}{:02x}{:02x}", r, g, b)
}

/// Favor buckets that are neither washed out nor fully saturated, and
/// neither near-black nor near-white.
fn muted_weight((r, g, b): (u8, u8, u8)) -> f64 {
    let max = r.max(g).max(b) as f64;
    let min = r.min(g).min(b) as f64;
    let value = max / 7.0;
    let saturation = if max > 0.0 { (max - min) / max } else { 0.0 };

    let sat_score = 1.0 - (saturation - 0.4).abs();
    let val_score = 1.0 - (value - 0.5).abs();
    0.25 + sat_score * val_score
}

#[derive(Debug, thiserror::Error)]
pub enum ColorError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("blocking task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn extraction_is_deterministic() {
        let bytes = png_bytes(RgbImage::from_pixel(32, 32, Rgb([120, 90, 70])));
        let first = PaletteExtractor.extract(&bytes).await.unwrap();
        let second = PaletteExtractor.extract(&bytes).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn dominant_color_lands_in_the_right_bucket() {
        let bytes = png_bytes(RgbImage::from_pixel(32, 32, Rgb([120, 90, 70])));
        let tag = PaletteExtractor.extract(&bytes).await.unwrap();
        // 120 >> 5 = 3 → center 0x70; 90 >> 5 = 2 → 0x50; 70 >> 5 = 2 → 0x50
        assert_eq!(tag, "705050");
    }

    #[tokio::test]
    async fn undecodable_bytes_fail() {
        let result = PaletteExtractor.extract(b"not an image").await;
        assert!(result.is_err());
    }
}
