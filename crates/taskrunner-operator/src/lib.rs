//! taskrunner operator
//!
//! Serves the batch job HTTP API and drives the periodic reconciler. The
//! binary in `main.rs` wires these together against a live cluster.

pub mod api;
pub mod config;
pub mod error;

pub use api::{router, AppState, Envelope};
pub use config::OperatorConfig;
pub use error::ApiError;
