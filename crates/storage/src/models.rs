//! Storage models.
//!
//! Snapshots of local files and remote objects, used for listing operations
//! and sync comparisons. None of these are persisted; every run re-derives
//! them from the filesystem and the remote listing.

use crate::checksum::ChecksumLayout;
use crate::key::ObjectKey;
use std::path::PathBuf;
use time::OffsetDateTime;

/// A local file as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Absolute path of the file
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp (UTC)
    pub modified: OffsetDateTime,
}
impl LocalFile {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self { path: path.into(), size, modified }
    }
}

/// Metadata of an object that exists in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Service-assigned last modified timestamp
    pub modified: OffsetDateTime,
    /// Object size in bytes
    pub size: u64,
    /// SHA-256 checksum computed by the store over the bytes it received
    /// (see [`checksum`](crate::checksum)). Listings never carry it, and
    /// objects written by other tools may not have one at all.
    pub fingerprint: Option<String>,
    /// Part size of an object stored in parts, if known.
    pub part_size: Option<u64>,
}
impl ObjectMeta {
    /// How local bytes must be split to produce a comparable checksum.
    /// `None` when the object was stored in parts of an unknown size.
    pub fn layout(&self) -> Option<ChecksumLayout> {
        let composite = self.fingerprint.as_deref().and_then(crate::checksum::part_count).is_some();
        match (composite, self.part_size) {
            (false, _) => Some(ChecksumLayout::Whole),
            (true, Some(size)) => Some(ChecksumLayout::Parts(size)),
            (true, None) => None,
        }
    }
}

/// A remote object as seen by a metadata lookup or a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: ObjectKey,
    /// `None` when no object exists under `key`.
    pub meta: Option<ObjectMeta>,
}
impl RemoteObject {
    pub fn absent(key: ObjectKey) -> Self {
        Self { key, meta: None }
    }

    pub fn present(key: ObjectKey, meta: ObjectMeta) -> Self {
        Self { key, meta: Some(meta) }
    }

    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.meta.as_ref().map(|m| m.modified)
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.fingerprint.as_deref())
    }
}

/// A single entry of a delimited listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// An actual stored object.
    Object(RemoteObject),
    /// A virtual directory: a common key prefix ending in `/`, with no
    /// object body of its own.
    Prefix(String),
    /// An object whose raw key cannot be safely mapped onto a local path
    /// (traversal segments, empty segments, ...).
    Unmapped(String),
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ListEntry>,
    /// Continuation token for the next page; `None` once the listing at
    /// this level is exhausted.
    pub next_token: Option<String>,
}
