//! Background workers for the replay relay.
//!
//! One periodic job: evicting stale sessions from registry memory and
//! deleting aged rows from the store.

pub mod cleanup;
pub mod scheduler;

pub use cleanup::*;
pub use relay_core::WorkerConfig;
pub use scheduler::*;
