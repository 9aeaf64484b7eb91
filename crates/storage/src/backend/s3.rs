//! S3-compatible object store.
//!
//! This module provides an [`ObjectStore`] implementation for S3-compatible
//! services including AWS S3, Backblaze B2, Cloudflare R2, MinIO, and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file (or the
//! matching `COFFER_STORAGE__*` environment variables).
//!
//! # Checksums
//!
//! Every `PutObject` and `UploadPart` request carries the SHA-256 of its body,
//! which the service validates before accepting it. The checksum the service
//! stored is read back by `HeadObject` with checksum mode enabled; for objects
//! uploaded in parts it is the composite form, and the part size needed to
//! reproduce it locally comes from a second `HeadObject` for part 1.

use crate::backend::{ObjectStore, UploadRequest};
use crate::error::{ErrorKind, Result};
use crate::checksum;
use crate::{BoxAsyncRead, ListEntry, ListPage, ObjectKey, ObjectMeta, RemoteObject};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::DisplayErrorContext,
    operation::head_object::HeadObjectError,
    primitives::{ByteStream, DateTime},
    types::{ChecksumAlgorithm, ChecksumMode, CompletedMultipartUpload, CompletedPart},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use exn::{OptionExt, ResultExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// Delimiter used to expose the virtual directory hierarchy.
const DELIMITER: &str = "/";

/// S3-compatible object store.
///
/// Stores objects in an S3 bucket. Keys are used verbatim; the bucket root
/// is the root of the virtual hierarchy.
///
/// # Examples
///
/// ```no_run
/// use coffer_storage::backend::S3Store;
///
/// # fn example() {
/// let store = S3Store::new(
///     "backups",
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
///     100,
/// );
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Store {
    /// Create a new S3 object store.
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    /// * `max_requests` - Ceiling on concurrent requests issued by this client
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        max_requests: usize,
    ) -> Self {
        let region = Region::new(region.into());
        let credentials = Credentials::new(key_id, key_secret, None, None, "coffer-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        // Set custom endpoint for non-AWS services
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self::from_client(Client::from_conf(config_builder.build()), bucket, max_requests)
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>, max_requests: usize) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            rate_limiter: Arc::new(Semaphore::new(max_requests.max(1))),
        }
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 request limiter closed".to_string()))
    }

    /// Convert AWS DateTime to OffsetDateTime.
    fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    fn network_error<E: std::error::Error>(operation: &str, key: &str, err: &E) -> ErrorKind {
        ErrorKind::Network(format!("{operation} s3 object {key:?}: {}", DisplayErrorContext(err)))
    }

    fn size_mismatch(key: &ObjectKey, expected: u64, read: u64) -> ErrorKind {
        ErrorKind::BackendError(format!("expected {expected} bytes for {key}, read {read}"))
    }

    async fn put_single(&self, key: &ObjectKey, mut body: BoxAsyncRead, request: &UploadRequest) -> Result<String> {
        // Below the multipart threshold the whole body is buffered; the
        // threshold is what bounds memory here.
        let mut data = Vec::with_capacity(usize::try_from(request.size).unwrap_or(0));
        body.read_to_end(&mut data).await.map_err(ErrorKind::Io)?;
        if data.len() as u64 != request.size {
            exn::bail!(Self::size_mismatch(key, request.size, data.len() as u64));
        }
        let checksum = checksum::sha256(&data);
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(i64::try_from(data.len()).unwrap_or(i64::MAX))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .checksum_sha256(&checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::network_error("upload", key.as_str(), &e))?;
        Ok(checksum)
    }

    async fn put_multipart(&self, key: &ObjectKey, body: BoxAsyncRead, request: &UploadRequest) -> Result<String> {
        let created = {
            let _permit = self.acquire_permit().await?;
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key.as_str())
                .checksum_algorithm(ChecksumAlgorithm::Sha256)
                .send()
                .await
                .map_err(|e| Self::network_error("create multipart upload", key.as_str(), &e))?
        };
        let upload_id = created
            .upload_id()
            .ok_or_raise(|| ErrorKind::BackendError(format!("no upload ID returned for {key}")))?
            .to_string();

        match self.upload_parts(key, &upload_id, body, request).await {
            Ok((parts, checksum)) => {
                let _permit = self.acquire_permit().await?;
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(|e| Self::network_error("complete multipart upload", key.as_str(), &e))?;
                Ok(checksum)
            },
            Err(e) => {
                // Best effort: leaving the upload dangling only costs storage
                // until the bucket's lifecycle rules clean it up.
                let aborted = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(&upload_id)
                    .send()
                    .await;
                if let Err(abort_err) = aborted {
                    tracing::warn!(key = %key, error = %DisplayErrorContext(&abort_err), "Failed to abort multipart upload");
                }
                Err(e)
            },
        }
    }

    /// Read the body sequentially in `part_size` chunks and keep at most
    /// `parallel_parts` part uploads in flight, so memory use is bounded by
    /// `part_size * parallel_parts` regardless of the object size.
    ///
    /// Returns the completed parts in part order, with the composite checksum
    /// of everything that was read.
    async fn upload_parts(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        mut body: BoxAsyncRead,
        request: &UploadRequest,
    ) -> Result<(Vec<CompletedPart>, String)> {
        let part_size = usize::try_from(request.options.part_size).unwrap_or(usize::MAX);
        let parallel = request.options.parallel_parts.get();
        let mut in_flight = FuturesUnordered::new();
        let mut completed = Vec::new();
        let mut digests = Vec::new();
        let mut part_number: i32 = 0;
        let mut sent: u64 = 0;

        loop {
            let mut chunk = Vec::with_capacity(part_size);
            (&mut body).take(part_size as u64).read_to_end(&mut chunk).await.map_err(ErrorKind::Io)?;
            if chunk.is_empty() {
                break;
            }
            sent += chunk.len() as u64;
            if sent > request.size {
                exn::bail!(Self::size_mismatch(key, request.size, sent));
            }
            part_number += 1;
            let digest = Sha256::digest(&chunk).as_slice().to_vec();
            in_flight.push(self.upload_part(key, upload_id, part_number, STANDARD.encode(&digest), chunk));
            digests.push(digest);
            if in_flight.len() >= parallel
                && let Some(result) = in_flight.next().await
            {
                completed.push(result?);
            }
        }
        while let Some(result) = in_flight.next().await {
            completed.push(result?);
        }

        if sent != request.size {
            exn::bail!(Self::size_mismatch(key, request.size, sent));
        }
        completed.sort_by_key(|part| part.part_number());
        Ok((completed, checksum::composite(&digests)))
    }

    async fn upload_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number: i32,
        part_checksum: String,
        chunk: Vec<u8>,
    ) -> Result<CompletedPart> {
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(i64::try_from(chunk.len()).unwrap_or(i64::MAX))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .checksum_sha256(&part_checksum)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .map_err(|e| Self::network_error("upload part of", key.as_str(), &e))?;
        let e_tag = output
            .e_tag()
            .ok_or_raise(|| ErrorKind::BackendError(format!("no ETag returned for part {part_number} of {key}")))?;
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(e_tag)
            .checksum_sha256(part_checksum)
            .build())
    }

    /// Size of the first part of an object stored in parts.
    async fn first_part_size(&self, key: &ObjectKey) -> Result<Option<u64>> {
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .part_number(1)
            .send()
            .await
            .map_err(|e| Self::network_error("head part of", key.as_str(), &e))?;
        Ok(output.content_length().and_then(|l| u64::try_from(l).ok()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn metadata(&self, key: &ObjectKey) -> Result<RemoteObject> {
        let result = {
            let _permit = self.acquire_permit().await?;
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key.as_str())
                .checksum_mode(ChecksumMode::Enabled)
                .send()
                .await
        };
        let output = match result {
            Ok(output) => output,
            // NotFound is not an error, it means the object doesn't exist.
            Err(err) if err.as_service_error().is_some_and(HeadObjectError::is_not_found) => {
                return Ok(RemoteObject::absent(key.clone()));
            },
            Err(err) => exn::bail!(Self::network_error("head", key.as_str(), &err)),
        };
        let modified = output
            .last_modified()
            .ok_or_raise(|| ErrorKind::BackendError(format!("no last-modified time for {key}")))
            .and_then(Self::parse_datetime)?;
        let fingerprint = output.checksum_sha256().map(str::to_string);
        let part_size = match fingerprint.as_deref().and_then(checksum::part_count) {
            Some(_) => self.first_part_size(key).await?,
            None => None,
        };
        let meta = ObjectMeta {
            modified,
            size: output.content_length().and_then(|l| u64::try_from(l).ok()).unwrap_or(0),
            fingerprint,
            part_size,
        };
        Ok(RemoteObject::present(key.clone(), meta))
    }

    async fn upload(&self, key: &ObjectKey, body: BoxAsyncRead, request: UploadRequest) -> Result<String> {
        if request.options.is_multipart(request.size) {
            tracing::debug!(key = %key, size = request.size, "Using multipart upload");
            self.put_multipart(key, body, &request).await
        } else {
            self.put_single(key, body, &request).await
        }
    }

    async fn download(&self, key: &ObjectKey) -> Result<BoxAsyncRead> {
        let _permit = self.acquire_permit().await?;
        let output = self.client.get_object().bucket(&self.bucket).key(key.as_str()).send().await.map_err(|err| {
            if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                ErrorKind::ObjectNotFound(key.to_string())
            } else {
                Self::network_error("download", key.as_str(), &err)
            }
        })?;
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn list_page(&self, prefix: Option<&str>, token: Option<&str>) -> Result<ListPage> {
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix.map(str::to_string))
            .delimiter(DELIMITER)
            .set_continuation_token(token.map(str::to_string))
            .send()
            .await
            .map_err(|e| Self::network_error("list", prefix.unwrap_or(""), &e))?;

        let mut entries = Vec::with_capacity(output.contents().len() + output.common_prefixes().len());
        for object in output.contents() {
            let Some(raw_key) = object.key() else { continue };
            // Zero-byte "folder" placeholders created by some consoles.
            if raw_key.ends_with('/') {
                continue;
            }
            let Ok(key) = ObjectKey::parse(raw_key) else {
                entries.push(ListEntry::Unmapped(raw_key.to_string()));
                continue;
            };
            let modified = object
                .last_modified()
                .ok_or_raise(|| ErrorKind::BackendError(format!("no last-modified time for {key}")))
                .and_then(Self::parse_datetime)?;
            let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0);
            let meta = ObjectMeta { modified, size, fingerprint: None, part_size: None };
            entries.push(ListEntry::Object(RemoteObject::present(key, meta)));
        }
        for common in output.common_prefixes() {
            if let Some(p) = common.prefix() {
                entries.push(ListEntry::Prefix(p.to_string()));
            }
        }

        let next_token = match output.is_truncated() {
            Some(true) => output.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok(ListPage { entries, next_token })
    }
}
