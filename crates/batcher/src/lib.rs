//! Write-behind batching between the session registry and the store.
//!
//! Producers enqueue [`relay_core::SessionBatch`] units; a worker drains the
//! queue on a timed interval and applies each drained run in one store
//! transaction. Past twice the flush size, `enqueue` turns synchronous and
//! the producer drives flushes itself until the depth falls back under the
//! cap. Failed runs are re-queued at the head, preserving order.

pub mod queue;
pub mod sink;
pub mod worker;

pub use relay_core::BatcherConfig;
pub use sink::*;
pub use worker::*;
