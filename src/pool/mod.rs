//! Transcoding pool, its execution units and configuration

pub mod config;
pub mod global;
pub mod manager;
pub mod readiness;
pub mod stats;
mod unit;
mod watchdog;

pub use config::{CloseMode, PoolConfig, ZeroCapacityPolicy};
pub use global::{global, init_global};
pub use manager::{TranscodePool, UnitId, UnitStatus};
pub use readiness::ReadySignal;
#[cfg(feature = "metrics")]
pub use stats::FormatStats;
pub use stats::PoolStats;
