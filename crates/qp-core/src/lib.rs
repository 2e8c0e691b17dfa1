//! qp-core: Configuration and shared utilities for QuickPort
//!
//! This crate provides the client configuration structure, its TOML
//! loading/saving helpers, and the associated error types.

pub mod config;
pub mod error;

pub use config::ClientConfig;
pub use error::ConfigError;
