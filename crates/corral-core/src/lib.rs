//! corral Core Library
//!
//! Shared functionality for corral components:
//! - Settings file loading and defaults
//! - Common error types
//! - Tracing/logging initialization

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Settings;
pub use error::{Error, Result};
