//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Both are fatal: nothing should be transferred with a configuration that
/// failed to load or validate.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A provider failed (unreadable file, malformed syntax, wrong types).
    #[display("failed to load configuration")]
    Load,
    /// The explicitly requested config file has an unsupported extension.
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// Settings loaded fine but are not usable.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
