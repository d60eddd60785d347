use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Luma};
use ::qrcode::QrCode;
use ::qrcode::render::unicode::Dense1x2;
use std::io::Cursor;
use thiserror::Error;

/// Smallest edge, in pixels, of a rendered PNG.
const MIN_PNG_SIZE: u32 = 240;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("content cannot be encoded as a QR code: {0}")]
    Encode(#[from] ::qrcode::types::QrError),
    #[error("failed to encode PNG: {0}")]
    Png(#[from] image::ImageError),
}

/// Renders `content` as a PNG bitmap.
pub fn render_png(content: &str) -> Result<Bytes, QrError> {
    let code = QrCode::new(content.as_bytes())?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(MIN_PNG_SIZE, MIN_PNG_SIZE)
        .build();

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img).write_to(&mut buf, ImageFormat::Png)?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Renders `content` with half-block characters for a terminal. Colors are
/// inverted so the code scans on dark backgrounds.
pub fn render_terminal(content: &str) -> Result<String, QrError> {
    let code = QrCode::new(content.as_bytes())?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_png_bitmap() {
        let png = render_png("https://login.weixin.qq.com/l/gYmgd1grLg==").unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn renders_terminal_blocks() {
        let text = render_terminal("https://login.weixin.qq.com/l/abc").unwrap();
        assert!(text.lines().count() > 10);
        assert!(text.contains('▀') || text.contains('▄') || text.contains('█'));
    }
}
