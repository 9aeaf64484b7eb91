//! Binary Error Types

use derive_more::{Display, Error};

/// A fatal error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for top-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that ends a run before it can produce a summary.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Loading or validating settings failed.
    #[display("configuration error")]
    Config,
    /// The command line and configuration don't describe a runnable job.
    #[display("{_0}")]
    Usage(#[error(not(source))] String),
    /// The engine refused to start a run.
    #[display("{_0} failed to start")]
    Run(#[error(not(source))] &'static str),
}
