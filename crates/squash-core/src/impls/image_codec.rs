//! Default codec backed by the `image` crate.
//!
//! Re-encodes the source in its own format:
//! - JPEG at the configured quality (85 by default)
//! - PNG with best compression and adaptive filtering
//! - WebP lossless
//!
//! Decoding and encoding are CPU-bound, so both run on the blocking pool.
//! Nothing is written here; the worker writes the returned bytes.

use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat, ImageReader};
use tokio::task;
use tracing::debug;

use crate::app::config::QualitySettings;
use crate::domain::CodecError;
use crate::ports::{Codec, Encoded};

#[derive(Debug, Clone)]
pub struct ImageCodec {
    jpeg_quality: u8,
}

impl ImageCodec {
    pub fn new(quality: &QualitySettings) -> Self {
        Self {
            jpeg_quality: quality.jpeg,
        }
    }
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::new(&QualitySettings::default())
    }
}

#[async_trait]
impl Codec for ImageCodec {
    async fn probe(&self, input: &Path) -> Result<String, CodecError> {
        let input = input.to_path_buf();
        task::spawn_blocking(move || {
            let format = probe_file(&input)?;
            Ok(format_name(format).to_string())
        })
        .await
        .map_err(|e| CodecError::Unreadable(format!("probe task failed: {e}")))?
    }

    async fn encode(&self, input: &Path) -> Result<Encoded, CodecError> {
        let input = input.to_path_buf();
        let quality = self.jpeg_quality;
        task::spawn_blocking(move || encode_file(&input, quality))
            .await
            .map_err(|e| CodecError::Encode(format!("codec task failed: {e}")))?
    }
}

/// Detect the format and read the header, without decoding pixels.
fn probe_file(input: &Path) -> Result<ImageFormat, CodecError> {
    let reader = ImageReader::open(input)?
        .with_guessed_format()
        .map_err(|e| CodecError::Unreadable(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| CodecError::Unsupported(input.display().to_string()))?;
    reader
        .into_dimensions()
        .map_err(|e| CodecError::Unreadable(e.to_string()))?;
    Ok(format)
}

fn encode_file(input: &Path, jpeg_quality: u8) -> Result<Encoded, CodecError> {
    let reader = ImageReader::open(input)?
        .with_guessed_format()
        .map_err(|e| CodecError::Unreadable(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| CodecError::Unsupported(input.display().to_string()))?;
    let img = reader
        .decode()
        .map_err(|e| CodecError::Unreadable(e.to_string()))?;

    let bytes = encode(&img, format, jpeg_quality)?;
    debug!(
        input = %input.display(),
        encoded_size = bytes.len(),
        "image re-encoded"
    );
    Ok(Encoded::new(bytes, format_name(format)))
}

fn encode(img: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> Result<Vec<u8>, CodecError> {
    let mut output = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut output, jpeg_quality);
            encoder
                .encode_image(&img.to_rgb8())
                .map_err(|e| CodecError::Encode(format!("JPEG: {e}")))?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(
                &mut output,
                CompressionType::Best,
                FilterType::Adaptive,
            );
            img.write_with_encoder(encoder)
                .map_err(|e| CodecError::Encode(format!("PNG: {e}")))?;
        }
        ImageFormat::WebP => {
            img.write_to(&mut Cursor::new(&mut output), ImageFormat::WebP)
                .map_err(|e| CodecError::Encode(format!("WebP: {e}")))?;
        }
        other => {
            return Err(CodecError::Unsupported(format_name(other).to_string()));
        }
    }
    Ok(output)
}

/// Upper-case format name as reported in outcomes.
pub fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "JPEG",
        ImageFormat::Png => "PNG",
        ImageFormat::WebP => "WEBP",
        ImageFormat::Gif => "GIF",
        ImageFormat::Bmp => "BMP",
        ImageFormat::Tiff => "TIFF",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use tempfile::tempdir;

    fn gradient(w: u32, h: u32) -> RgbImage {
        ImageBuffer::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[tokio::test]
    async fn encodes_png_without_writing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("photo.png");
        gradient(64, 64).save(&input).unwrap();

        let codec = ImageCodec::default();
        assert_eq!(codec.probe(&input).await.unwrap(), "PNG");

        let encoded = codec.encode(&input).await.unwrap();
        assert_eq!(encoded.format, "PNG");
        assert!(!encoded.bytes.is_empty());
        assert_eq!(
            image::guess_format(&encoded.bytes).unwrap(),
            ImageFormat::Png
        );
        // only the source is in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn encodes_jpeg() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("photo.jpg");
        gradient(32, 32).save(&input).unwrap();

        let encoded = ImageCodec::default().encode(&input).await.unwrap();
        assert_eq!(encoded.format, "JPEG");
        assert_eq!(
            image::guess_format(&encoded.bytes).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_unreadable() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("broken.png");
        std::fs::write(&input, b"definitely not a png").unwrap();

        let codec = ImageCodec::default();
        assert!(matches!(
            codec.probe(&input).await,
            Err(CodecError::Unreadable(_))
        ));
        assert!(codec.encode(&input).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = ImageCodec::default()
            .probe(Path::new("/definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }
}
