//! Storage capabilities used by the sync engine.
//!
//! Two collaborators live here: the remote [`ObjectStore`] (a flat, keyed
//! object namespace with a `/`-delimited virtual hierarchy) and the local
//! filesystem [`LocalFs`]. Both are object-safe so the engine can hold them
//! as [`StoreHandle`] / [`FsHandle`] and tests can swap in doubles.

pub mod backend;
pub mod checksum;
pub mod error;
mod key;
pub mod local;
mod models;

pub use crate::backend::{ObjectStore, UploadOptions, UploadRequest};
pub use crate::key::ObjectKey;
pub use crate::local::{CreationMode, LocalFilesystem, LocalFs};
pub use crate::models::{ListEntry, ListPage, LocalFile, ObjectMeta, RemoteObject};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub type StoreHandle = Arc<dyn ObjectStore + Send + Sync>;
pub type FsHandle = Arc<dyn LocalFs + Send + Sync>;

/// Owned, sendable byte stream handed between collaborators.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send + 'static>>;
