//! Error types for the rebalance planner.
//!
//! Operational failures (a remote create, move, or remove that did not take
//! effect) are reported through return values and completion callbacks, never
//! as errors. `Error` is reserved for misuse of the API and for invariant
//! violations that indicate a bug in the search logic.

use crate::types::{BucketId, MemberId};
use thiserror::Error;

/// Result type alias for planner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the planner.
#[derive(Error, Debug)]
pub enum Error {
    /// The planner proposed a move it had already attempted. The attempted
    /// sets must strictly grow, otherwise the search loop would re-propose
    /// the same move forever. This is a programming error, not an
    /// environmental failure.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A move referenced a bucket that does not exist in the model.
    #[error("unknown bucket: {0}")]
    UnknownBucket(BucketId),

    /// A move referenced a member that is not part of the model.
    #[error("unknown member: {0}")]
    UnknownMember(MemberId),

    /// Invalid session configuration or call sequence.
    #[error("config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownMember(MemberId::new("m9"));
        assert_eq!(err.to_string(), "unknown member: m9");

        let err = Error::InvariantViolation("move proposed twice".into());
        assert!(err.to_string().contains("invariant violation"));
    }
}
