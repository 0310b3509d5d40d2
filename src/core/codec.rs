//! Codec trait and conversion output
//!
//! The pool never touches pixels. It hands each task's input and options to
//! a [`Codec`] on one of its execution units and publishes whatever comes
//! back.

use crate::core::cancellation::CancellationToken;
use crate::core::options::{ConvertOptions, ImageFormat};
use std::fmt;
use std::sync::Arc;

/// Failure reported by a codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CodecError {
    message: String,
}

impl CodecError {
    /// Create a codec error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The codec's message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for CodecError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CodecError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result of a successful conversion
///
/// The encoded bytes are shared, so every observer of a task handle can hold
/// the output without copying it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConvertOutput {
    data: Arc<Vec<u8>>,
    /// Format of `data`
    pub format: ImageFormat,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Source width in pixels
    pub original_width: u32,
    /// Source height in pixels
    pub original_height: u32,
}

impl fmt::Debug for ConvertOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertOutput")
            .field("bytes", &self.data.len())
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("original_width", &self.original_width)
            .field("original_height", &self.original_height)
            .finish()
    }
}

impl ConvertOutput {
    /// Output with unknown dimensions
    pub fn new(data: Vec<u8>, format: ImageFormat) -> Self {
        Self {
            data: Arc::new(data),
            format,
            width: 0,
            height: 0,
            original_width: 0,
            original_height: 0,
        }
    }

    /// Set output dimensions
    #[must_use]
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set source dimensions
    #[must_use]
    pub fn with_original_dimensions(mut self, width: u32, height: u32) -> Self {
        self.original_width = width;
        self.original_height = height;
        self
    }

    /// Encoded bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the output is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the bytes, copying only if another observer still shares them
    pub fn into_bytes(self) -> Vec<u8> {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }
}

/// The external image codec
///
/// Implementations must be safe to call from several units at once. A unit
/// calls [`warm_up`](Self::warm_up) once when it starts, then
/// [`convert`](Self::convert) once per task. Panics are contained by the
/// unit and reported as a worker crash.
pub trait Codec: Send + Sync {
    /// Load whatever runtime the codec needs on the calling thread
    ///
    /// # Errors
    ///
    /// A failure retires the unit before it accepts any task.
    fn warm_up(&self) -> Result<(), CodecError> {
        Ok(())
    }

    /// Convert one input buffer
    ///
    /// `token` is cancelled when the caller cancels the task, its deadline
    /// passes, or the pool closes immediately. Polling it is optional.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for inputs the codec cannot handle.
    fn convert(
        &self,
        input: &[u8],
        options: &ConvertOptions,
        token: &CancellationToken,
    ) -> Result<ConvertOutput, CodecError>;

    /// Codec name for logs
    fn name(&self) -> &str {
        "Codec"
    }
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Codec({})", self.name())
    }
}

/// A codec shared by every unit of a pool
pub type SharedCodec = Arc<dyn Codec>;

/// Helper to create a codec from a closure
pub struct FnCodec<F>
where
    F: Fn(&[u8], &ConvertOptions, &CancellationToken) -> Result<ConvertOutput, CodecError>
        + Send
        + Sync,
{
    convert: F,
    name: String,
}

impl<F> FnCodec<F>
where
    F: Fn(&[u8], &ConvertOptions, &CancellationToken) -> Result<ConvertOutput, CodecError>
        + Send
        + Sync,
{
    /// Create a new closure codec
    pub fn new(convert: F) -> Self {
        Self {
            convert,
            name: "FnCodec".to_string(),
        }
    }

    /// Create a new closure codec with a custom name
    pub fn with_name<S: Into<String>>(convert: F, name: S) -> Self {
        Self {
            convert,
            name: name.into(),
        }
    }
}

impl<F> Codec for FnCodec<F>
where
    F: Fn(&[u8], &ConvertOptions, &CancellationToken) -> Result<ConvertOutput, CodecError>
        + Send
        + Sync,
{
    fn convert(
        &self,
        input: &[u8],
        options: &ConvertOptions,
        token: &CancellationToken,
    ) -> Result<ConvertOutput, CodecError> {
        (self.convert)(input, options, token)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
