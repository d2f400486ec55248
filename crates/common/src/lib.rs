//! ChatGate common library
//!
//! This crate contains shared code used by the inference worker and the HTTP server.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ChatGateError, Result};
pub use metrics::{MetricsRegistry, METRICS};
