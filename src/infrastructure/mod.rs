//! Infrastructure layer module
//!
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)
//!
//! The in-memory implementations of the domain ports live in `adapters`.

pub mod config;
pub mod logging;
