//! Postgres-backed durable repository for sessions, events, and errors.

pub mod client;
pub mod health;
pub mod insert;
pub mod models;
pub mod query;
pub mod schema;

pub use client::*;
pub use models::*;
pub use relay_core::StoreConfig;
