//! Authentication challenge rendering.
//!
//! Turns the opaque challenge payload into something a browser can show
//! directly: a PNG QR code packed into a data URL.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Payload cannot be encoded as a QR code: {0}")]
    Encode(String),

    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Renders challenge payloads into a displayable representation
pub trait CodeRenderer: Send + Sync {
    fn render(&self, payload: &str) -> Result<String, RenderError>;
}

/// QR code as `data:image/png;base64,...`
#[derive(Debug, Clone)]
pub struct QrDataUrlRenderer {
    /// Minimum edge length of the PNG in pixels
    pub min_size: u32,
}

impl Default for QrDataUrlRenderer {
    fn default() -> Self {
        Self { min_size: 264 }
    }
}

impl CodeRenderer for QrDataUrlRenderer {
    fn render(&self, payload: &str) -> Result<String, RenderError> {
        let code = QrCode::new(payload.as_bytes()).map_err(|e| RenderError::Encode(e.to_string()))?;
        let image = code
            .render::<Luma<u8>>()
            .min_dimensions(self.min_size, self.min_size)
            .build();

        let mut png = Vec::new();
        DynamicImage::ImageLuma8(image).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

        Ok(format!("data:image/png;base64,{}", BASE64.encode(&png)))
    }
}
