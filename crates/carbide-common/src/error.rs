//! Error types for Carbide
//!
//! This module defines the common error types used throughout the engine.

use thiserror::Error;

/// Common result type for Carbide operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Carbide
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator could not return a single extent for a request.
    ///
    /// A short allocation (some space returned, but less than asked for)
    /// is reported by the caller that decided to roll it back, so `allocated`
    /// records how far the allocator got before the request was abandoned.
    #[error("out of space: wanted {wanted} bytes, allocator returned {allocated} bytes")]
    OutOfSpace { wanted: u64, allocated: u64 },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    /// A caller-ordering bug or on-disk corruption risk was detected.
    ///
    /// These are not recoverable: continuing could persist corrupted
    /// mappings, so the operation must stop immediately.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check whether this error may not be survived by the shard.
    ///
    /// Out-of-space and I/O failures are ordinary failed-operation results;
    /// invariant violations are not.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
