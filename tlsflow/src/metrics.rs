//! Prometheus metrics for the capture pipeline.
//!
//! - `registry`: collector definitions and the global registry
//! - `server`: HTTP endpoint serving `/metrics`

pub mod registry;
pub mod server;
