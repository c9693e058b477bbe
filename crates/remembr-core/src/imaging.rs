//! Outbound image preparation: downscale, JPEG re-encode, base64 payloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;

const DEFAULT_MAX_WIDTH: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode JPEG: {0}")]
    Encode(#[source] image::ImageError),
}

/// Bounds applied to every image before it leaves the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSettings {
    pub max_width: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// An image ready to embed in a request: MIME type plus base64 data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// Downscale to at most `max_width` (aspect preserved) and re-encode as JPEG.
pub fn compress(image: &DynamicImage, settings: ImageSettings) -> Result<InlineImage, ImageError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::Empty);
    }

    let scaled = if image.width() > settings.max_width {
        let ratio = settings.max_width as f32 / image.width() as f32;
        let height = ((image.height() as f32 * ratio).round() as u32).max(1);
        image.resize_exact(settings.max_width, height, FilterType::Triangle)
    } else {
        image.clone()
    };

    let rgb = scaled.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, settings.jpeg_quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(ImageError::Encode)?;

    tracing::debug!(
        width = rgb.width(),
        height = rgb.height(),
        bytes = buf.len(),
        "image compressed"
    );

    Ok(InlineImage {
        mime_type: DEFAULT_MIME.to_string(),
        data: BASE64.encode(&buf),
    })
}

/// Split a stored photo into MIME type and bare base64 payload.
///
/// Accepts either `data:<mime>;base64,<payload>` or a bare payload.
pub fn inline_photo(photo: &str) -> InlineImage {
    let photo = photo.trim();
    if let Some(rest) = photo.strip_prefix("data:") {
        if let Some((header, payload)) = rest.split_once(',') {
            let mime = header.split(';').next().filter(|m| !m.is_empty());
            return InlineImage {
                mime_type: mime.unwrap_or(DEFAULT_MIME).to_string(),
                data: payload.to_string(),
            };
        }
    }
    InlineImage {
        mime_type: DEFAULT_MIME.to_string(),
        data: photo.to_string(),
    }
}

/// Encode raw file bytes as a `data:` URL for storage on a [`Visitor`](crate::Visitor).
pub fn to_data_url(bytes: &[u8]) -> String {
    let mime = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        _ => DEFAULT_MIME,
    };
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([120, 80, 40])))
    }

    fn decoded(inline: &InlineImage) -> DynamicImage {
        let bytes = BASE64.decode(inline.data.as_bytes()).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn test_compress_downscales_wide_image() {
        let out = compress(&solid(1280, 720), ImageSettings::default()).unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        let img = decoded(&out);
        assert_eq!(img.width(), 640);
        assert_eq!(img.height(), 360);
    }

    #[test]
    fn test_compress_keeps_small_image_size() {
        let img = decoded(&compress(&solid(320, 240), ImageSettings::default()).unwrap());
        assert_eq!((img.width(), img.height()), (320, 240));
    }

    #[test]
    fn test_compress_rejects_empty() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(compress(&empty, ImageSettings::default()), Err(ImageError::Empty)));
    }

    #[test]
    fn test_inline_photo_strips_data_url() {
        let inline = inline_photo("data:image/png;base64,AAAA");
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "AAAA");

        let bare = inline_photo("BBBB");
        assert_eq!(bare.mime_type, "image/jpeg");
        assert_eq!(bare.data, "BBBB");
    }

    #[test]
    fn test_data_url_decodes_back() {
        let mut png = Vec::new();
        solid(4, 4)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let url = to_data_url(&png);
        assert!(url.starts_with("data:image/png;base64,"));
        let payload = inline_photo(&url).data;
        assert_eq!(BASE64.decode(payload.as_bytes()).unwrap(), png);
    }
}
