//! Middleware for observability.
//!
//! This module provides request logging with latency tracking, shared
//! across every route registered in `api::router`.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
