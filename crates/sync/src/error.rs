//! Sync Error Types
//!
//! Per-item errors end up inside a [`TransferOutcome`](crate::TransferOutcome)
//! rather than aborting the run; only [`ErrorKind::Configuration`] is raised
//! to the caller before any work starts.

use derive_more::{Display, Error};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Missing or invalid settings, or an unusable root directory.
    #[display("configuration error: {_0}")]
    Configuration(#[error(not(source))] String),
    /// A path outside the root, or a key that cannot become a local path.
    #[display("cannot map {_0:?} between path and key")]
    PathMapping(#[error(not(source))] String),
    /// Upload, download or metadata lookup failed.
    #[display("transfer failed")]
    Transfer,
    /// A remote listing call failed; the subtree below it was abandoned.
    #[display("listing failed below {_0:?}")]
    Listing(#[error(not(source))] String),
    /// Reading the local tree failed.
    #[display("enumeration failed")]
    Enumeration,
    /// The run was cancelled before this item was transferred.
    #[display("cancelled")]
    Cancelled,
    /// Every pipeline worker has stopped; nothing can be submitted.
    #[display("transfer pipeline closed")]
    PipelineClosed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer | Self::Listing(_) | Self::Enumeration)
    }
}
