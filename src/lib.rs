//! Per-interface connectivity testing daemon
//!
//! For each configured network interface the daemon periodically runs
//! external probe executables, interprets their exit codes as pass/fail,
//! classifies the interface as operational or broken against configurable
//! thresholds, rotates through external recovery actions while the interface
//! is broken, and publishes status transitions on the IPC bus. The sibling
//! configurator process feeds the daemon its configuration and runs an
//! operator-notification executable on every classification flip.

pub mod bus;
pub mod configurator;
pub mod daemon;
pub mod domain;
pub mod engine;

// Re-export core types for public API
pub use domain::error::{Error, Result};
