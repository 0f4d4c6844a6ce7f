//! Shared error-handling primitives used across the clawmem workspace.

pub mod error;

pub use error::{Error, FromMessage, Result};
