//! # Strand Utilities
//!
//! Shared logging and configuration helpers for Strand.
//!
//! This crate provides common functionality used across the Strand workspace,
//! including the logging infrastructure built on `tracing`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with, init_logging_with_level, LogFormat, LogLevel, LoggingConfig, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
