//! Error type definitions for the Amps server
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

pub mod types;

pub use types::{AmpsError, RelayError};

/// Convenient result alias for application-level operations
pub type AmpsResult<T> = Result<T, AmpsError>;
