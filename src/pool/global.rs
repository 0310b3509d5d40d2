//! Process-wide pool
//!
//! Most applications want one transcoding pool shared by every request
//! handler. [`init_global`] installs it once; [`global`] hands it out.
//! Capacity can then be adjusted from anywhere with
//! `global().map(|p| p.set_capacity(n))`.

use crate::core::{Codec, PoolError, Result};
use crate::pool::config::PoolConfig;
use crate::pool::manager::TranscodePool;
use std::sync::OnceLock;

static GLOBAL: OnceLock<TranscodePool> = OnceLock::new();

/// Install the process-wide pool
///
/// Fails with [`PoolError::InvalidConfig`] if a global pool already exists
/// or the configuration is invalid. The global pool is never dropped; call
/// [`TranscodePool::close`] before exiting if queued work must finish.
pub fn init_global(config: PoolConfig, codec: impl Codec + 'static) -> Result<&'static TranscodePool> {
    if GLOBAL.get().is_some() {
        return Err(already_initialized());
    }
    let pool = TranscodePool::new(config, codec)?;
    GLOBAL.set(pool).map_err(|_| already_initialized())?;
    GLOBAL.get().ok_or_else(already_initialized)
}

/// The process-wide pool, if installed
pub fn global() -> Option<&'static TranscodePool> {
    GLOBAL.get()
}

fn already_initialized() -> PoolError {
    PoolError::invalid_config("global", "global pool is already initialized")
}
