//! Shared domain types for the imagineit client.
//!
//! Holds the generation configuration, its precondition validation, and
//! the common type aliases used by the backend client and the progress
//! reconciler. Zero internal dependencies.

pub mod error;
pub mod generation;
pub mod types;
