//! Core types, configuration, and errors for the replay relay.

pub mod batch;
pub mod config;
pub mod error;
pub mod session;

pub use batch::*;
pub use config::*;
pub use error::{Error, Result};
pub use session::*;
