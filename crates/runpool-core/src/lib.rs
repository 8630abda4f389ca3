//! `runpool` Core Library
//!
//! Shared functionality for `runpool` components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Optional `OpenTelemetry` export
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
