//! Core types and utilities for the license-plate fraud classifier.
//!
//! This crate provides the error type, configuration, metric plumbing and
//! CLI helpers shared by the dataset, training and tool crates.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used items
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
