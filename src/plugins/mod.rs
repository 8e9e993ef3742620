//! Telemetry subsystems: the two collectors, the gate, and batch collection.

pub mod batch;
pub mod benchmark;
pub mod coverage;
pub mod gate;

use std::time::Duration;

/// Per-invocation knobs shared by both collectors.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Overrides the configured runner timeout.
    pub timeout: Option<Duration>,
}
