//! The stateful broker: session registry, connection hub, wire messages.
//!
//! Trackers stream recorded DOM events in; viewers subscribe to sessions and
//! receive the same events live. The registry owns authoritative in-memory
//! session state, the hub owns connection state and fan-out, and everything
//! durable flows through the write-behind batcher.

pub mod client;
pub mod hub;
pub mod messages;
pub mod registry;

pub use client::*;
pub use hub::*;
pub use messages::*;
pub use registry::*;
pub use relay_core::BrokerConfig;
