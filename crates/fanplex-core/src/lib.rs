//! `fanplex` Core Library
//!
//! Shared functionality for `fanplex` components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, LogConfig, MergeConfig, Overflow, QueuePolicy, SplitConfig};
pub use error::{Error, Result};
