//! Conversion options
//!
//! [`ConvertOptions`] is the closed, validated replacement for a loose option
//! bag. Values are range-checked once, when the task is submitted; a task
//! whose options fail validation never reaches the queue.

use crate::core::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest accepted encoder quality
pub const MAX_QUALITY: u8 = 100;
/// Highest accepted encoder speed
pub const MAX_SPEED: u8 = 10;

/// Output format of a conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Keep the source format and only apply resizing
    #[serde(alias = "none")]
    Original,
    /// PNG
    Png,
    /// JPEG
    #[serde(alias = "jpg")]
    Jpeg,
    /// WebP
    #[default]
    Webp,
    /// AVIF
    Avif,
}

impl ImageFormat {
    /// All formats, in declaration order
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Original,
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Webp,
        ImageFormat::Avif,
    ];

    /// Lower-case name used in option bags
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Original => "original",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    /// MIME type of the encoded output, `None` when the source format is kept
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            ImageFormat::Original => None,
            ImageFormat::Png => Some("image/png"),
            ImageFormat::Jpeg => Some("image/jpeg"),
            ImageFormat::Webp => Some("image/webp"),
            ImageFormat::Avif => Some("image/avif"),
        }
    }

    /// Whether the encoder honours the quality setting
    pub fn uses_quality(self) -> bool {
        matches!(self, ImageFormat::Jpeg | ImageFormat::Webp | ImageFormat::Avif)
    }

    /// Whether the encoder honours the speed setting
    pub fn uses_speed(self) -> bool {
        self == ImageFormat::Avif
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" | "none" => Ok(ImageFormat::Original),
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "webp" => Ok(ImageFormat::Webp),
            "avif" => Ok(ImageFormat::Avif),
            other => Err(PoolError::validation(
                "format",
                format!("unsupported format '{}'", other),
            )),
        }
    }
}

/// Options for one conversion
///
/// Fields are public so callers can use struct-update syntax; nothing is
/// checked until [`validate`](Self::validate) runs at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    /// Target format
    pub format: ImageFormat,
    /// Encoder quality, 0..=100 (JPEG, WebP, AVIF)
    pub quality: u8,
    /// Encoder speed, 0..=10, slower to faster (AVIF)
    pub speed: u8,
    /// Target width; `None` or 0 keeps the original width
    pub width: Option<u32>,
    /// Target height; `None` or 0 keeps the original height
    pub height: Option<u32>,
    /// Apply the resampling filter when resizing
    pub filter: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::default(),
            quality: 80,
            speed: 6,
            width: None,
            height: None,
            filter: true,
        }
    }
}

impl ConvertOptions {
    /// Options targeting `format` with default quality and speed
    #[must_use]
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Set encoder quality
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Set encoder speed
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = speed;
        self
    }

    /// Set target width
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    /// Set target height
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Set target size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_size(self, width: u32, height: u32) -> Self {
        self.with_width(width).with_height(height)
    }

    /// Enable or disable the resampling filter
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.quality > MAX_QUALITY {
            return Err(PoolError::validation(
                "quality",
                format!("{} is outside 0..={}", self.quality, MAX_QUALITY),
            ));
        }
        if self.speed > MAX_SPEED {
            return Err(PoolError::validation(
                "speed",
                format!("{} is outside 0..={}", self.speed, MAX_SPEED),
            ));
        }
        Ok(())
    }

    /// Validate and fold zero dimensions into "keep original"
    pub fn normalized(self) -> Result<Self> {
        self.validate()?;
        Ok(Self {
            width: self.width.filter(|w| *w > 0),
            height: self.height.filter(|h| *h > 0),
            ..self
        })
    }

    /// Whether the output is resized
    pub fn resizes(&self) -> bool {
        self.width.is_some_and(|w| w > 0) || self.height.is_some_and(|h| h > 0)
    }

    /// Parse and validate a JSON option bag
    ///
    /// Missing keys take their defaults and unrelated keys are ignored.
    /// Numbers outside their range, negative sizes and unknown formats are
    /// reported as [`PoolError::Validation`].
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawOptions = serde_json::from_str(json)
            .map_err(|e| PoolError::validation("options", e.to_string()))?;
        raw.into_options()
    }
}

/// Loosely typed mirror of [`ConvertOptions`] used while parsing
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    format: Option<String>,
    quality: Option<i64>,
    speed: Option<i64>,
    width: Option<i64>,
    height: Option<i64>,
    filter: Option<bool>,
}

impl RawOptions {
    fn into_options(self) -> Result<ConvertOptions> {
        let defaults = ConvertOptions::default();
        let format = match self.format {
            Some(name) => name.parse()?,
            None => defaults.format,
        };
        let options = ConvertOptions {
            format,
            quality: bounded("quality", self.quality, MAX_QUALITY)?.unwrap_or(defaults.quality),
            speed: bounded("speed", self.speed, MAX_SPEED)?.unwrap_or(defaults.speed),
            width: dimension("width", self.width)?,
            height: dimension("height", self.height)?,
            filter: self.filter.unwrap_or(defaults.filter),
        };
        options.normalized()
    }
}

fn bounded(field: &str, value: Option<i64>, max: u8) -> Result<Option<u8>> {
    match value {
        None => Ok(None),
        Some(v) if (0..=i64::from(max)).contains(&v) => Ok(Some(v as u8)),
        Some(v) => Err(PoolError::validation(
            field,
            format!("{} is outside 0..={}", v, max),
        )),
    }
}

fn dimension(field: &str, value: Option<i64>) -> Result<Option<u32>> {
    match value {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| PoolError::validation(field, format!("{} is not a valid size", v))),
    }
}
