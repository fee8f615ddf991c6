//! Middleware for observability.
//!
//! This module provides request logging with latency tracking. Quota
//! enforcement lives in [`crate::auth::AuthEngine`], which gates per-user
//! per-day, not per-IP, so there is no rate-limiting layer here.

pub mod logging;

pub use logging::request_logging;
