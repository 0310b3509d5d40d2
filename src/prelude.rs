//! Convenient re-exports for common types and traits

pub use crate::core::{
    CancellationReason, CancellationToken, Codec, CodecError, ConvertOptions, ConvertOutput,
    ErrorKind, FnCodec, ImageFormat, PoolError, Result, TaskHandle, TaskState,
};
pub use crate::pool::{CloseMode, PoolConfig, PoolStats, TranscodePool, ZeroCapacityPolicy};
