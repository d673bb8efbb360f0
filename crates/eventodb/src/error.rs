use thiserror::Error;

use crate::stream_name::EmptyStreamName;

/// Type alias for `Result<T, eventodb::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents all the ways a store operation can fail.
///
/// `WrongExpectedVersion` is an expected outcome of optimistic concurrency,
/// not a fault; callers are given the observed version so they can refetch
/// and retry. Backend I/O failures are wrapped in `Backend` and surfaced
/// without internal retries.
#[derive(Debug, Error)]
pub enum Error {
    /// The stream's current version did not match the caller's
    /// `expected_version`. `actual` is `-1` when the stream has no messages.
    #[error("wrong expected version: {expected} (stream: {stream_name}, stream version: {actual})")]
    WrongExpectedVersion {
        stream_name: String,
        expected: i64,
        actual: i64,
    },

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("invalid namespace id: {0}")]
    InvalidNamespaceId(String),

    /// A caller-supplied message id that is not a valid UUID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    #[error(transparent)]
    EmptyStreamName(#[from] EmptyStreamName),

    #[error("backend error: {0}")]
    Backend(anyhow::Error),
}

impl Error {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Error::Backend(err.into())
    }

    /// Whether the error indicates the namespace's physical container has not
    /// become visible yet. Used by backends to absorb the narrow window
    /// between registry insert and container visibility.
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, Error::NamespaceNotFound(_))
    }
}
