//! Internal telemetry for the replay relay.
//!
//! In-process metrics and health state, surfaced through the relay's own
//! HTTP endpoints rather than an external metrics system.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
