//! Error types for the flow-state table.
//!
//! Absence is never an error: lookups return `None`. The only failure the
//! table reports is a write aimed at the aggregate instead of a shard.

use thiserror::Error;

/// Errors returned by [`FlowStateTable`](crate::state::FlowStateTable) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowStateError {
    /// A shard-exclusive write was attempted on the aggregate table.
    #[error("invalid usage: {operation} must target a shard, not the aggregate table")]
    InvalidUsage { operation: &'static str },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowStateError>;
