//! Object store trait and implementations.
//!
//! This module defines the [`ObjectStore`] trait, which provides a unified
//! interface to a remote object container across different backends
//! (S3-compatible services, an in-memory store for tests, etc.).
//!

#[cfg(feature = "mock")]
mod memory;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "mock")]
pub use self::memory::MemoryStore;
#[cfg(feature = "s3")]
pub use self::s3::S3Store;
use crate::checksum::ChecksumLayout;
use crate::error::Result;
use crate::{BoxAsyncRead, ListPage, ObjectKey, RemoteObject};
use async_trait::async_trait;
use std::num::NonZeroUsize;

/// Minimum multipart part size accepted by S3-compatible services (except
/// for the final part).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Tuning for a single object upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Objects larger than this many bytes are sent as a multipart upload.
    pub single_upload_threshold: u64,
    /// Size of each multipart part, in bytes.
    pub part_size: u64,
    /// Number of parts in flight at once for a multipart upload.
    pub parallel_parts: NonZeroUsize,
}
impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            single_upload_threshold: 32 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
            parallel_parts: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
        }
    }
}
impl UploadOptions {
    /// Whether an object of `size` bytes should be uploaded in parts.
    pub fn is_multipart(&self, size: u64) -> bool {
        size > self.single_upload_threshold
    }

    /// How an object of `size` bytes is split on upload.
    pub fn layout(&self, size: u64) -> ChecksumLayout {
        if self.is_multipart(size) { ChecksumLayout::Parts(self.part_size) } else { ChecksumLayout::Whole }
    }
}

/// Everything the store needs to know about an upload besides the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Exact number of bytes the body will yield.
    pub size: u64,
    pub options: UploadOptions,
}

/// Unified interface for remote object containers.
///
/// The namespace is flat (string keys) but exposes a virtual hierarchy
/// through [`list_page`](Self::list_page), which groups keys sharing a
/// common prefix up to the next `/` into [`ListEntry::Prefix`](crate::ListEntry::Prefix)
/// entries.
///
/// # Examples
///
/// ```
/// use coffer_storage::{ObjectKey, ObjectStore, error::Result};
///
/// async fn last_modified(store: &dyn ObjectStore) -> Result<Option<String>> {
///     let key = ObjectKey::parse("photos/beach.jpg")?;
///     let object = store.metadata(&key).await?;
///     Ok(object.modified().map(|m| m.to_string()))
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the configured container, for logging.
    fn name(&self) -> &str;

    /// Check if an object exists.
    ///
    /// Default implementation asks for [`metadata()`](Self::metadata) and
    /// discards everything but the existence flag.
    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.metadata(key).await?.exists())
    }

    /// Get object metadata without reading its body.
    ///
    /// A missing object is **not** an error: the returned
    /// [`RemoteObject`] simply reports `exists() == false`.
    async fn metadata(&self, key: &ObjectKey) -> Result<RemoteObject>;

    /// Upload an object from a stream, creating or replacing it.
    ///
    /// # Notes
    /// - Bodies larger than [`UploadOptions::single_upload_threshold`] are
    ///   sent in parts of [`UploadOptions::part_size`] bytes, with at most
    ///   [`UploadOptions::parallel_parts`] in flight.
    /// - A body that yields more or fewer than `request.size` bytes fails
    ///   the upload.
    /// - Every request carries the SHA-256 checksum of the bytes it sends, so
    ///   the store rejects anything it received differently.
    ///
    /// Returns the [checksum](crate::checksum) of the bytes read from `body`.
    /// Comparing it with what a later [`metadata()`](Self::metadata) reports
    /// checks the store's copy against what was sent, without reading the
    /// source again.
    async fn upload(&self, key: &ObjectKey, body: BoxAsyncRead, request: UploadRequest) -> Result<String>;

    /// Open an object body for streaming reads.
    ///
    /// Returns [`ObjectNotFound`](crate::error::ErrorKind::ObjectNotFound) if
    /// the object does not exist.
    async fn download(&self, key: &ObjectKey) -> Result<BoxAsyncRead>;

    /// Fetch a single page of a `/`-delimited listing.
    ///
    /// `prefix` restricts the listing to keys starting with it (a virtual
    /// directory prefix ends with `/`). Pass the `next_token` of the previous
    /// page to continue; a page with `next_token == None` is the last one at
    /// this level.
    async fn list_page(&self, prefix: Option<&str>, token: Option<&str>) -> Result<ListPage>;
}
