//! Photo compaction for inline transport.
//!
//! Photos travel inside records, so they must fit a hard byte ceiling.
//! Quality is traded first, resolution second.

use std::io::Cursor;

use image::{codecs::jpeg::JpegEncoder, DynamicImage, GenericImageView};
use tracing::{debug, warn};

/// Default ceiling for an inline asset.
pub const DEFAULT_MAX_ASSET_BYTES: usize = 900 * 1024;

/// JPEG qualities tried at every resolution, best first.
const QUALITY_LADDER: [u8; 6] = [90, 80, 70, 60, 50, 40];

/// Longest-edge targets tried once the original resolution cannot fit.
const DIMENSION_LADDER: [u32; 5] = [2000, 1600, 1200, 900, 600];

/// Re-encode `bytes` so the result fits in `max_bytes`.
///
/// Input that already fits is returned unchanged. Otherwise the first
/// attempt that fits wins; when none does, the smallest attempt is
/// returned. Returns `None` only when the input cannot be decoded.
pub fn compact(bytes: &[u8], max_bytes: usize) -> Option<Vec<u8>> {
    if bytes.len() <= max_bytes {
        return Some(bytes.to_vec());
    }

    let source = match image::load_from_memory(bytes) {
        Ok(image) => DynamicImage::ImageRgb8(image.to_rgb8()),
        Err(error) => {
            warn!("Cannot compact undecodable asset: {error}");
            return None;
        }
    };

    let (width, height) = source.dimensions();
    let longest = width.max(height);
    let mut smallest: Option<Vec<u8>> = None;

    let resized = DIMENSION_LADDER
        .into_iter()
        .filter(|target| *target < longest)
        .map(|target| (target, source.thumbnail(target, target)));

    for (target, image) in std::iter::once((longest, source.clone())).chain(resized) {
        for quality in QUALITY_LADDER {
            let Some(encoded) = encode_jpeg(&image, quality) else {
                continue;
            };
            if encoded.len() <= max_bytes {
                debug!(
                    "Compacted asset from {} to {} bytes at {target}px, quality {quality}",
                    bytes.len(),
                    encoded.len()
                );
                return Some(encoded);
            }
            if smallest.as_ref().map_or(true, |best| encoded.len() < best.len()) {
                smallest = Some(encoded);
            }
        }
    }

    debug!(
        "No attempt fit {max_bytes} bytes; keeping smallest of {} bytes",
        smallest.as_ref().map_or(0, Vec::len)
    );
    smallest
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
    if let Err(error) = encoder.encode_image(image) {
        warn!("Failed to encode JPEG at quality {quality}: {error}");
        return None;
    }
    Some(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width, height, |x, y| {
            let seed = x
                .wrapping_mul(1_103_515_245)
                .wrapping_add(y.wrapping_mul(12_345))
                .wrapping_mul(2_654_435_761);
            let [r, g, b, _] = seed.to_le_bytes();
            Rgb([r, g, b])
        });

        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn input_within_ceiling_is_untouched() {
        let source = noisy_png(16, 16);
        assert_eq!(compact(&source, source.len()), Some(source));
    }

    #[test]
    fn undecodable_input_yields_none() {
        assert_eq!(compact(&[0x42; 4096], 1024), None);
    }

    #[test]
    fn result_fits_ceiling_or_is_smallest_attempt() {
        let source = noisy_png(800, 800);

        let smallest = compact(&source, 1).unwrap();
        assert!(smallest.len() < source.len());

        let fitted = compact(&source, smallest.len()).unwrap();
        assert!(fitted.len() <= smallest.len());
        assert!(image::load_from_memory(&fitted).is_ok());
    }

    #[test]
    fn compaction_is_deterministic() {
        let source = noisy_png(400, 300);
        assert_eq!(compact(&source, 10_000), compact(&source, 10_000));
    }

    #[test]
    fn never_upscales() {
        let source = noisy_png(120, 90);
        let compacted = compact(&source, 1).unwrap();
        let decoded = image::load_from_memory(&compacted).unwrap();
        assert_eq!(decoded.dimensions(), (120, 90));
    }
}
