//! Core types for minirpc.
//!
//! - **Errors**: error enum with thiserror derives
//! - **Config**: server, client and observability configuration

mod config;
mod errors;

pub use config::{ClientConfig, Config, ObservabilityConfig, ServerConfig};
pub use errors::{Error, Result};
