//! Screen capture and image normalization for model consumption.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::actions::ScreenBounds;
use crate::device::{DeviceAdapter, DeviceError};

/// Images more elongated than this are rejected by the vision encoder.
pub const MAX_ASPECT_RATIO: f64 = 200.0;

/// JPEG quality used when PNG exceeds the byte budget.
const JPEG_QUALITY: u8 = 85;

/// Perception errors.
#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error(transparent)]
    Capture(#[from] DeviceError),
    #[error("Failed to encode screenshot: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Screenshot aspect ratio {0:.1} exceeds {MAX_ASPECT_RATIO}")]
    AspectRatio(f64),
    #[error("Screenshot has zero size")]
    Empty,
}

/// Size budget for images sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBudget {
    /// Both sides are rounded to multiples of this (vision patch size).
    pub factor: u32,
    pub min_pixels: u32,
    pub max_pixels: u32,
    /// Upper bound on the encoded (pre-base64) image size.
    pub max_encoded_bytes: usize,
}

impl Default for ImageBudget {
    fn default() -> Self {
        Self {
            factor: 28,
            min_pixels: 4 * 28 * 28,
            max_pixels: 1280 * 28 * 28,
            max_encoded_bytes: 1024 * 1024,
        }
    }
}

/// A normalized screenshot ready to attach to a model message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Normalized image, kept for artifacts.
    pub image: Arc<DynamicImage>,
    /// Base64 of the encoded image.
    pub encoded: Arc<str>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub is_sensitive: bool,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// `data:` URL for OpenAI-style image content.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.encoded)
    }

    /// Bounds of the normalized image, the space model coordinates live in.
    pub fn bounds(&self) -> ScreenBounds {
        ScreenBounds::new(self.width, self.height)
    }

    /// Ratio from normalized to source pixels.
    pub fn scale(&self) -> (f64, f64) {
        (
            self.source_width as f64 / self.width.max(1) as f64,
            self.source_height as f64 / self.height.max(1) as f64,
        )
    }

    /// Encoded size in bytes before base64.
    pub fn encoded_len(&self) -> usize {
        self.encoded.len() / 4 * 3
    }
}

/// Compute target dimensions: multiples of `factor`, pixel count within budget,
/// aspect ratio preserved as closely as the rounding allows.
pub fn smart_resize(
    width: u32,
    height: u32,
    budget: &ImageBudget,
) -> Result<(u32, u32), PerceptionError> {
    if width == 0 || height == 0 {
        return Err(PerceptionError::Empty);
    }
    let ratio = width.max(height) as f64 / width.min(height) as f64;
    if ratio > MAX_ASPECT_RATIO {
        return Err(PerceptionError::AspectRatio(ratio));
    }

    let factor = budget.factor.max(1) as f64;
    let (w, h) = (width as f64, height as f64);
    let round_to = |v: f64| ((v / factor).round() * factor).max(factor);
    let mut w_bar = round_to(w);
    let mut h_bar = round_to(h);

    if w_bar * h_bar > budget.max_pixels as f64 {
        let beta = (w * h / budget.max_pixels as f64).sqrt();
        w_bar = ((w / beta / factor).floor() * factor).max(factor);
        h_bar = ((h / beta / factor).floor() * factor).max(factor);
    } else if w_bar * h_bar < budget.min_pixels as f64 {
        let beta = (budget.min_pixels as f64 / (w * h)).sqrt();
        w_bar = (w * beta / factor).ceil() * factor;
        h_bar = (h * beta / factor).ceil() * factor;
    }

    Ok((w_bar as u32, h_bar as u32))
}

/// Resize and encode an image so it fits the budget.
pub fn normalize(image: &DynamicImage, budget: &ImageBudget) -> Result<Frame, PerceptionError> {
    let (source_width, source_height) = (image.width(), image.height());
    let (width, height) = smart_resize(source_width, source_height, budget)?;

    let mut resized = if (width, height) == (source_width, source_height) {
        image.clone()
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    };

    let factor = budget.factor.max(1);
    let (bytes, mime_type) = loop {
        let (bytes, mime_type) = encode(&resized, budget.max_encoded_bytes)?;
        if bytes.len() <= budget.max_encoded_bytes {
            break (bytes, mime_type);
        }
        let next_w = ((resized.width() * 3 / 4) / factor * factor).max(factor);
        let next_h = ((resized.height() * 3 / 4) / factor * factor).max(factor);
        if (next_w, next_h) == (resized.width(), resized.height()) {
            break (bytes, mime_type);
        }
        debug!(
            bytes = bytes.len(),
            next_w, next_h, "Screenshot over byte budget, downscaling"
        );
        resized = resized.resize_exact(next_w, next_h, FilterType::Lanczos3);
    };

    Ok(Frame {
        width: resized.width(),
        height: resized.height(),
        image: Arc::new(resized),
        encoded: STANDARD.encode(&bytes).into(),
        mime_type,
        source_width,
        source_height,
        is_sensitive: false,
        captured_at: Utc::now(),
    })
}

/// PNG first; JPEG when PNG is over budget.
fn encode(
    image: &DynamicImage,
    max_bytes: usize,
) -> Result<(Vec<u8>, &'static str), PerceptionError> {
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    let png = png.into_inner();
    if png.len() <= max_bytes {
        return Ok((png, "image/png"));
    }

    let mut jpeg = Vec::new();
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY))?;
    Ok((jpeg, "image/jpeg"))
}

/// Wraps device capture and normalization.
#[derive(Clone)]
pub struct PerceptionAdapter {
    device: Arc<dyn DeviceAdapter>,
    budget: ImageBudget,
}

impl PerceptionAdapter {
    pub fn new(device: Arc<dyn DeviceAdapter>, budget: ImageBudget) -> Self {
        Self { device, budget }
    }

    pub fn budget(&self) -> &ImageBudget {
        &self.budget
    }

    /// Capture the screen and normalize it for the model.
    pub async fn capture(&self) -> Result<Frame, PerceptionError> {
        let shot = self.device.capture().await?;
        let mut frame = normalize(&shot.image, &self.budget)?;
        frame.is_sensitive = shot.is_sensitive;
        Ok(frame)
    }
}
