//! In-memory object store for testing.

use crate::backend::{ObjectStore, UploadRequest};
use crate::checksum::{ChecksumHasher, ChecksumLayout};
use crate::error::{ErrorKind, Result};
use crate::{BoxAsyncRead, ListEntry, ListPage, ObjectKey, ObjectMeta, RemoteObject};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    modified: OffsetDateTime,
    /// Computed by the store over the bytes it holds, like S3 does.
    checksum: Option<String>,
    part_size: Option<u64>,
    data: Vec<u8>,
}
impl StoredObject {
    fn new(data: Vec<u8>, layout: ChecksumLayout, modified: OffsetDateTime) -> Self {
        let part_size = match layout {
            ChecksumLayout::Whole => None,
            ChecksumLayout::Parts(size) => Some(size),
        };
        Self { modified, checksum: Some(checksum_of(&data, layout)), part_size, data }
    }
}

fn checksum_of(data: &[u8], layout: ChecksumLayout) -> String {
    let mut hasher = ChecksumHasher::new(layout);
    hasher.update(data);
    hasher.finalize()
}

/// In-memory object store for testing.
///
/// Objects are stored in a `BTreeMap` behind a [`RwLock`], so listings come
/// back in key order and all trait methods operate on `&self`. Pages are
/// `page_size` entries long, which makes continuation tokens easy to
/// exercise with small trees.
///
/// Uploads follow the same contract as the S3 store: the returned checksum
/// describes the bytes read from the body, and the checksum reported by
/// [`metadata()`](ObjectStore::metadata) is computed over the bytes actually
/// stored, split the way the upload split them.
///
/// Faults can be injected: uploads to chosen keys fail with a
/// [`Network`](ErrorKind::Network) error, listings under chosen prefixes
/// fail, uploads can be silently corrupted before they are stored, and
/// downloads of chosen keys can be corrupted on the way out.
///
/// # Examples
///
/// ```
/// use coffer_storage::backend::{MemoryStore, ObjectStore};
/// use coffer_storage::ObjectKey;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::with_objects([("root/a.txt", b"hello")]).with_page_size(2);
/// let key = ObjectKey::parse("root/a.txt").unwrap();
/// assert!(store.exists(&key).await.unwrap());
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    name: String,
    page_size: usize,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing_uploads: HashSet<String>,
    failing_listings: HashSet<String>,
    corrupt_downloads: HashSet<String>,
    corrupt_uploads: AtomicBool,
    uploads: AtomicUsize,
}

impl MemoryStore {
    /// Create a store pre-populated with objects, all modified "now" and
    /// checksummed whole from their content.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then the
    /// test should not pass.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut map = BTreeMap::new();
        for (key, data) in objects {
            let key = Self::checked_key(key.into());
            map.insert(key, StoredObject::new(data.into(), ChecksumLayout::Whole, now));
        }
        Self {
            objects: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Insert (or replace) an object with an explicit modification time.
    pub async fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>, modified: OffsetDateTime) {
        let key = Self::checked_key(key.into());
        self.objects.write().await.insert(key, StoredObject::new(data.into(), ChecksumLayout::Whole, modified));
    }

    /// Drop the checksum of an object, as if it had been written by a tool
    /// that doesn't send one.
    pub async fn forget_fingerprint(&self, key: &str) {
        if let Some(object) = self.objects.write().await.get_mut(key) {
            object.checksum = None;
        }
    }

    /// Change the name of the store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Change the number of entries returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make every upload to `key` fail with a network error.
    pub fn with_failing_upload(mut self, key: impl Into<String>) -> Self {
        self.failing_uploads.insert(key.into());
        self
    }

    /// Make every listing of `prefix` fail with a network error.
    pub fn with_failing_listing(mut self, prefix: impl Into<String>) -> Self {
        self.failing_listings.insert(prefix.into());
        self
    }

    /// Flip a byte of every download of `key` on its way to the caller.
    pub fn with_corrupted_download(mut self, key: impl Into<String>) -> Self {
        self.corrupt_downloads.insert(key.into());
        self
    }

    /// Flip a byte of every subsequently uploaded body before storing it.
    pub fn corrupt_uploads(&self) {
        self.corrupt_uploads.store(true, Ordering::SeqCst);
    }

    /// Number of uploads that completed.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Raw stored bytes of an object, if present.
    pub async fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn checked_key(key: String) -> String {
        match ObjectKey::parse(key.clone()) {
            Ok(valid) => valid.as_str().to_string(),
            // The panic here is DELIBERATE. MemoryStore is intended to be
            // used in tests; panics are expected. There is no error result.
            Err(_) => panic!("MemoryStore: invalid key {key}"),
        }
    }

    fn meta(object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            modified: object.modified,
            size: object.data.len() as u64,
            fingerprint: object.checksum.clone(),
            part_size: object.part_size,
        }
    }
}
impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            objects: RwLock::new(BTreeMap::new()),
            failing_uploads: HashSet::new(),
            failing_listings: HashSet::new(),
            corrupt_downloads: HashSet::new(),
            corrupt_uploads: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        }
    }
}

fn flip_first_byte(data: &mut Vec<u8>) {
    match data.first_mut() {
        Some(first) => *first ^= 0x01,
        None => data.push(0),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn metadata(&self, key: &ObjectKey) -> Result<RemoteObject> {
        let guard = self.objects.read().await;
        Ok(match guard.get(key.as_str()) {
            Some(object) => RemoteObject::present(key.clone(), Self::meta(object)),
            None => RemoteObject::absent(key.clone()),
        })
    }

    async fn upload(&self, key: &ObjectKey, mut body: BoxAsyncRead, request: UploadRequest) -> Result<String> {
        if self.failing_uploads.contains(key.as_str()) {
            exn::bail!(ErrorKind::Network(format!("injected upload failure for {key}")));
        }
        let mut data = Vec::with_capacity(usize::try_from(request.size).unwrap_or(0));
        body.read_to_end(&mut data).await.map_err(ErrorKind::Io)?;
        if data.len() as u64 != request.size {
            exn::bail!(ErrorKind::BackendError(format!(
                "expected {} bytes for {key}, received {}",
                request.size,
                data.len()
            )));
        }
        let layout = request.options.layout(request.size);
        let sent = checksum_of(&data, layout);
        if self.corrupt_uploads.load(Ordering::SeqCst) {
            flip_first_byte(&mut data);
        }
        let object = StoredObject::new(data, layout, OffsetDateTime::now_utc());
        self.objects.write().await.insert(key.as_str().to_string(), object);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(sent)
    }

    async fn download(&self, key: &ObjectKey) -> Result<BoxAsyncRead> {
        let mut data = self
            .objects
            .read()
            .await
            .get(key.as_str())
            .map(|o| o.data.clone())
            .ok_or_else(|| exn::Exn::from(ErrorKind::ObjectNotFound(key.to_string())))?;
        if self.corrupt_downloads.contains(key.as_str()) {
            flip_first_byte(&mut data);
        }
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn list_page(&self, prefix: Option<&str>, token: Option<&str>) -> Result<ListPage> {
        let prefix = prefix.unwrap_or("");
        if self.failing_listings.contains(prefix) {
            exn::bail!(ErrorKind::Network(format!("injected listing failure for {prefix:?}")));
        }
        let offset = match token {
            Some(t) => t.parse::<usize>().map_err(|_| ErrorKind::BackendError(format!("bad continuation token {t:?}")))?,
            None => 0,
        };

        // Snapshot the full delimited listing under the read lock, then page
        // through it. Prefixes are de-duplicated and sorted among the objects
        // the same way S3 orders `CommonPrefixes`.
        let entries: Vec<ListEntry> = {
            let guard = self.objects.read().await;
            let mut seen = BTreeSet::new();
            let mut entries = Vec::new();
            for (key, object) in guard.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)) {
                let rest = &key[prefix.len()..];
                match rest.find('/') {
                    Some(idx) => {
                        let virtual_dir = format!("{prefix}{}", &rest[..=idx]);
                        if seen.insert(virtual_dir.clone()) {
                            entries.push(ListEntry::Prefix(virtual_dir));
                        }
                    },
                    None => {
                        // Keys were validated on the way in.
                        let key = ObjectKey::parse(key.clone())?;
                        entries.push(ListEntry::Object(RemoteObject::present(key, Self::meta(object))));
                    },
                }
            }
            entries
        };

        let end = (offset + self.page_size).min(entries.len());
        let page = entries.get(offset..end).map(<[ListEntry]>::to_vec).unwrap_or_default();
        let next_token = (end < entries.len()).then(|| end.to_string());
        Ok(ListPage { entries: page, next_token })
    }
}
