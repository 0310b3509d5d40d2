//! # Transcode Pool
//!
//! A bounded, resizable pool of execution units for CPU-bound image
//! conversion.
//!
//! ## Features
//!
//! - **Lazy units**: a unit starts only when a task is waiting and no unit is idle
//! - **Strict FIFO**: tasks are handed out in submission order
//! - **Live resizing**: capacity changes apply immediately, without interrupting conversions
//! - **Crash containment**: a panicking codec takes down its unit, never the pool
//! - **Deadlines and cancellation**: per-task timeouts and handles that can cancel
//! - **Clean shutdown**: graceful or immediate close, every task resolved exactly once
//!
//! ## Quick Start
//!
//! ```rust
//! use transcode_pool::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let codec = FnCodec::new(|input, options, _token| {
//!     // decode, resize and encode here
//!     Ok(ConvertOutput::new(input.to_vec(), options.format))
//! });
//! let pool = TranscodePool::new(PoolConfig::new(4), codec)?;
//!
//! let handles = (0..10)
//!     .map(|i| pool.submit(vec![i; 64], ConvertOptions::new(ImageFormat::Webp).with_quality(75)))
//!     .collect::<Result<Vec<_>>>()?;
//!
//! for handle in handles {
//!     let output = handle.wait()?;
//!     assert_eq!(output.format, ImageFormat::Webp);
//! }
//!
//! pool.close(CloseMode::Graceful)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resizing
//!
//! ```rust
//! use transcode_pool::prelude::*;
//!
//! # fn main() -> Result<()> {
//! # let codec = FnCodec::new(|input, options, _| Ok(ConvertOutput::new(input.to_vec(), options.format)));
//! let pool = TranscodePool::new(PoolConfig::new(0), codec)?;
//!
//! // Nothing runs while capacity is 0
//! let handle = pool.submit(vec![1, 2, 3], ConvertOptions::default())?;
//! assert_eq!(handle.state(), TaskState::Queued);
//!
//! pool.set_capacity(2);
//! assert!(handle.wait().is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Codecs
//!
//! ```rust
//! use transcode_pool::prelude::*;
//!
//! struct Passthrough;
//!
//! impl Codec for Passthrough {
//!     fn convert(
//!         &self,
//!         input: &[u8],
//!         options: &ConvertOptions,
//!         token: &CancellationToken,
//!     ) -> std::result::Result<ConvertOutput, CodecError> {
//!         token.check()?;
//!         if input.is_empty() {
//!             return Err(CodecError::new("empty input"));
//!         }
//!         Ok(ConvertOutput::new(input.to_vec(), options.format))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "Passthrough"
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let pool = TranscodePool::new(PoolConfig::new(1), Passthrough)?;
//! let err = pool.submit(Vec::new(), ConvertOptions::default())?.wait().unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Codec);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod pool;
pub mod prelude;
#[cfg(feature = "tracing")]
pub mod tracing;

pub use crate::core::{
    CancellationReason, CancellationToken, Codec, CodecError, ConvertOptions, ConvertOutput,
    ErrorKind, FnCodec, ImageFormat, PoolError, Result, TaskHandle, TaskId, TaskOutcome,
    TaskState, MAX_QUALITY, MAX_SPEED,
};
pub use crate::pool::{
    global, init_global, CloseMode, PoolConfig, PoolStats, ReadySignal, TranscodePool, UnitId,
    UnitStatus, ZeroCapacityPolicy,
};
