//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 checksum of an object in the form the store
//! reports it (see [`coffer_storage::checksum`]): computed by the store over
//! the bytes it received, never supplied by us. It is only ever used as a
//! post-transfer safety net and as a tie-breaker for stale local files;
//! transfer decisions are otherwise driven by timestamps (see
//! [`decision`](crate::decision)).

use coffer_storage::checksum::{self, ChecksumHasher, ChecksumLayout};
use coffer_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
use coffer_storage::{BoxAsyncRead, LocalFs, RemoteObject};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Post-transfer verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Matched,
    /// The bytes on one side do not hash to the fingerprint reported by the
    /// other. The transfer itself still counts as done.
    Mismatched,
    /// No verification was attempted (skipped or failed transfers), or the
    /// store reported no usable fingerprint to compare against.
    NotChecked,
}

/// A fingerprint reported by the store, with what it takes to reproduce it
/// from local bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFingerprint {
    pub value: String,
    pub layout: ChecksumLayout,
}
impl StoredFingerprint {
    /// `None` if the object has no fingerprint, or was stored in parts of an
    /// unknown size.
    pub fn of(object: &RemoteObject) -> Option<Self> {
        let meta = object.meta.as_ref()?;
        Some(Self { value: meta.fingerprint.clone()?, layout: meta.layout()? })
    }
}

/// Fingerprint an in-memory buffer stored in one piece.
///
/// # Examples
///
/// ```
/// use coffer_sync::integrity::fingerprint;
///
/// assert_eq!(fingerprint(b"hi"), fingerprint(b"hi"));
/// assert_ne!(fingerprint(b"hi"), fingerprint(b"hj"));
/// ```
pub fn fingerprint(bytes: &[u8]) -> String {
    checksum::sha256(bytes)
}

/// Fingerprint a stream without holding all of it in memory.
pub async fn fingerprint_stream(mut reader: BoxAsyncRead, layout: ChecksumLayout) -> std::io::Result<String> {
    let mut hasher = ChecksumHasher::new(layout);
    let mut buffer = vec![0; READ_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

/// Fingerprint the local file at `path`.
pub async fn fingerprint_file(fs: &dyn LocalFs, path: &Path, layout: ChecksumLayout) -> StorageResult<String> {
    let reader = fs.open_read(path).await?;
    Ok(fingerprint_stream(reader, layout).await.map_err(StorageErrorKind::Io)?)
}

/// Read the whole local file and compare its fingerprint with `expected`.
pub async fn verify(fs: &dyn LocalFs, path: &Path, expected: &StoredFingerprint) -> StorageResult<bool> {
    Ok(fingerprint_file(fs, path, expected.layout).await? == expected.value)
}
