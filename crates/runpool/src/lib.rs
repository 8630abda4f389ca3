//! runpool Library
//!
//! Core functionality for the runpool CLI:
//! - Concurrency-bounded process pool with FIFO admission
//! - Per-execution timeouts and single-winner completion
//! - Graceful-then-forceful shutdown
//! - Execution metrics

pub mod pool;
#[cfg(feature = "metrics")]
pub mod telemetry;

pub use pool::{
    BatchCommand, ExecuteOptions, IoMode, PoolError, PoolState, ProcessMetrics, ProcessPool,
    ProcessPoolConfig, ProcessResult,
};
