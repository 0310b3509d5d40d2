//! Core types: conversion options, codecs, tasks and errors

pub mod cancellation;
pub mod codec;
pub mod error;
pub mod options;
pub mod signal;
pub mod task;

pub use cancellation::{CancellationReason, CancellationToken};
pub use codec::{Codec, CodecError, ConvertOutput, FnCodec, SharedCodec};
pub use error::{ErrorKind, PoolError, Result};
pub use options::{ConvertOptions, ImageFormat, MAX_QUALITY, MAX_SPEED};
pub use signal::OnceSignal;
pub use task::{TaskHandle, TaskId, TaskOutcome, TaskState};

pub(crate) use task::{CancelHook, Task, TaskShared};
