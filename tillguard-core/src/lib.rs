//! Tillguard Core - shared infrastructure for the session and authorization core
//!
//! Holds the pieces every other crate leans on: the error type with context,
//! TOML configuration, logging setup and the async helpers used for timeouts
//! and background tasks.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;

// Re-export commonly used external types
pub use tokio;
pub use tracing;
