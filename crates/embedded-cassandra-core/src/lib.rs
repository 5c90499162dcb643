//! Embedded Cassandra Core - Platform-independent abstractions and configurations
//!
//! This crate provides the core traits, configurations, and error types
//! that are shared by the platform-specific process managers and the
//! high-level node launcher.

pub mod config;
pub mod error;
pub mod output;
pub mod process;
pub mod version;

pub use config::*;
pub use error::*;
pub use output::*;
pub use process::*;
pub use version::*;
