//! Background image transcoding.

use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use log::info;

use crate::core::bluetooth::BackgroundImage;
use crate::error::BridgeError;

pub const PRIMARY_SIZE: u32 = 240;
pub const THUMBNAIL_SIZE: u32 = 80;
pub const IMAGE_TYPE_TAG: &str = "image";

/// Decodes `path`, scales it to the primary and thumbnail rasters and encodes both as PNG.
/// Blocking: call from the blocking pool.
pub fn transcode_background(path: &Path) -> Result<BackgroundImage, BridgeError> {
    if !path.exists() {
        return Err(BridgeError::FileNotFound(path.to_path_buf()));
    }

    let decode_error = |reason: String| BridgeError::ImageDecode {
        path: path.to_path_buf(),
        reason,
    };
    let decoded = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| decode_error(e.to_string()))?
        .decode()
        .map_err(|e| decode_error(e.to_string()))?;
    let source = DynamicImage::ImageRgba8(decoded.to_rgba8());

    // Triangle is bilinear: deterministic for a given input
    let primary = source.resize_exact(PRIMARY_SIZE, PRIMARY_SIZE, FilterType::Triangle);
    let thumbnail = source.resize_exact(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle);

    let primary = encode_png(&primary).map_err(|e| decode_error(e.to_string()))?;
    let thumbnail = encode_png(&thumbnail).map_err(|e| decode_error(e.to_string()))?;
    info!(
        "Transcoded {:?} ({}x{}) to {} + {} PNG bytes",
        path,
        source.width(),
        source.height(),
        primary.len(),
        thumbnail.len()
    );

    Ok(BackgroundImage {
        primary,
        thumbnail,
        width: PRIMARY_SIZE,
        height: PRIMARY_SIZE,
        thumb_width: THUMBNAIL_SIZE,
        thumb_height: THUMBNAIL_SIZE,
        kind: IMAGE_TYPE_TAG.to_string(),
    })
}

fn encode_png(raster: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    raster.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_sample(path: &Path) {
        let mut img = RgbImage::new(320, 200);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
        }
        img.save(path).unwrap();
    }

    #[test]
    fn produces_both_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_sample(&path);

        let background = transcode_background(&path).unwrap();

        assert_eq!((background.width, background.height), (240, 240));
        assert_eq!((background.thumb_width, background.thumb_height), (80, 80));
        assert_eq!(background.kind, "image");
        let primary = image::load_from_memory_with_format(&background.primary, ImageFormat::Png).unwrap();
        let thumbnail = image::load_from_memory_with_format(&background.thumbnail, ImageFormat::Png).unwrap();
        assert_eq!((primary.width(), primary.height()), (240, 240));
        assert_eq!((thumbnail.width(), thumbnail.height()), (80, 80));
    }

    #[test]
    fn output_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        write_sample(&path);

        let first = transcode_background(&path).unwrap();
        let second = transcode_background(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn format_is_sniffed_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("photo.png");
        write_sample(&png);
        let misnamed = dir.path().join("photo.dat");
        std::fs::copy(&png, &misnamed).unwrap();

        assert!(transcode_background(&misnamed).is_ok());
    }

    #[test]
    fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        assert!(matches!(transcode_background(&path), Err(BridgeError::ImageDecode { .. })));
    }

    #[test]
    fn missing_file_is_reported_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nowhere.png");

        assert!(matches!(transcode_background(&path), Err(BridgeError::FileNotFound(_))));
    }
}
