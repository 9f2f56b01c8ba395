use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::error::RequestError;

/// Decode a base64 PNG/JPEG/... payload into an RGB bitmap.
///
/// A `data:<mime>;base64,` prefix and surrounding whitespace are tolerated.
/// Non-RGB sources (RGBA, grayscale, 16-bit) are converted; no resizing happens here.
pub fn decode_base64_image(encoded: &str) -> Result<RgbImage, RequestError> {
    let payload = strip_data_url(encoded.trim());
    let bytes = B64.decode(payload.as_bytes())?;
    let img = image::load_from_memory(&bytes)?;
    Ok(into_rgb(img))
}

fn strip_data_url(s: &str) -> &str {
    match s.split_once(";base64,") {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => s,
    }
}

fn into_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

/// Encode an image as base64 in the given container format.
pub fn encode_base64(img: &DynamicImage, format: ImageFormat) -> Result<String, image::ImageError> {
    let mut out_bytes: Vec<u8> = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out_bytes);
    img.write_to(&mut cursor, format)?;
    Ok(B64.encode(out_bytes))
}

pub fn encode_png_base64(img: &DynamicImage) -> Result<String, image::ImageError> {
    encode_base64(img, ImageFormat::Png)
}

/// Base64 of raw file bytes, as a client would send them.
pub fn encode_bytes_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}
