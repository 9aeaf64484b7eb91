//! Single-item transfers in either direction.
//!
//! Each call decides, transfers and verifies one item, and always comes back
//! with a [`TransferOutcome`]: per-item errors are folded into the outcome
//! here so they can never stop sibling transfers.

use crate::decision::{self, Action, RestoreCheck, TransferDecision};
use crate::error::{ErrorKind, Result};
use crate::integrity::{self, Integrity, StoredFingerprint};
use crate::keymap;
use crate::outcome::TransferOutcome;
use coffer_storage::error::ErrorKind as StorageErrorKind;
use coffer_storage::{
    CreationMode, FsHandle, LocalFile, ObjectKey, RemoteObject, StoreHandle, UploadOptions, UploadRequest,
};
use exn::ResultExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Clone)]
pub struct TransferWorker {
    store: StoreHandle,
    fs: FsHandle,
    upload: UploadOptions,
    cancel: CancellationToken,
}

impl TransferWorker {
    pub fn new(store: StoreHandle, fs: FsHandle, upload: UploadOptions, cancel: CancellationToken) -> Self {
        Self { store, fs, upload, cancel }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        Ok(())
    }

    /// Upload `file`, found below `root`, if the remote copy is missing or
    /// older.
    #[instrument(skip(self, root, file), fields(path = %file.path.display()))]
    pub async fn backup(&self, root: &Path, file: LocalFile) -> TransferOutcome {
        let item = file.path.display().to_string();
        match self.backup_inner(root, file).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(item = %item, error = ?error, "backup failed");
                TransferOutcome::failed(item, error)
            },
        }
    }

    async fn backup_inner(&self, root: &Path, file: LocalFile) -> Result<TransferOutcome> {
        self.check_cancelled()?;
        let item = file.path.display().to_string();
        let key = keymap::to_key(root, &file.path)?;

        // Metadata is re-read now rather than trusted from enumeration time.
        let modified = self.fs.last_modified(&file.path).await.or_raise(|| ErrorKind::Transfer)?;
        let local = LocalFile { modified, ..file };
        let remote = self.store.metadata(&key).await.or_raise(|| ErrorKind::Transfer)?;
        let decision = decision::decide_backup(&local, &remote);
        tracing::debug!(key = %key, %decision, "backup decision");
        if decision.is_skip() {
            return Ok(TransferOutcome::skipped(item, decision.reason));
        }

        self.check_cancelled()?;
        let body = self.fs.open_read(&local.path).await.or_raise(|| ErrorKind::Transfer)?;
        let request = UploadRequest { size: local.size, options: self.upload };
        let sent = self.store.upload(&key, body, request).await.or_raise(|| ErrorKind::Transfer)?;
        tracing::info!(key = %key, size = local.size, action = %decision.action, "uploaded");

        let integrity = self.verify_backup(&key, &local.path, &sent).await;
        Ok(TransferOutcome::succeeded(item, decision.action, integrity))
    }

    /// Compare the fingerprint of the bytes that were sent with the one the
    /// store computed over what it kept. The file is not read again.
    async fn verify_backup(&self, key: &ObjectKey, path: &Path, sent: &str) -> Integrity {
        let stored = match self.store.metadata(key).await {
            Ok(remote) => remote.fingerprint().map(str::to_string),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "could not read back object metadata for verification");
                return Integrity::NotChecked;
            },
        };
        match stored {
            Some(stored) if stored == sent => Integrity::Matched,
            Some(stored) => {
                tracing::error!(
                    key = %key,
                    path = %path.display(),
                    sent,
                    stored = %stored,
                    "INTEGRITY ALARM: stored object does not match the uploaded content"
                );
                Integrity::Mismatched
            },
            None => {
                tracing::debug!(key = %key, "store reported no fingerprint; verification skipped");
                Integrity::NotChecked
            },
        }
    }

    async fn verify_local(&self, path: &Path, recorded: Option<&StoredFingerprint>, key: &ObjectKey) -> Integrity {
        let Some(recorded) = recorded else {
            tracing::debug!(key = %key, "no usable fingerprint; verification skipped");
            return Integrity::NotChecked;
        };
        match integrity::verify(self.fs.as_ref(), path, recorded).await {
            Ok(true) => Integrity::Matched,
            Ok(false) => {
                tracing::error!(
                    key = %key,
                    path = %path.display(),
                    expected = %recorded.value,
                    "INTEGRITY ALARM: content does not match the recorded fingerprint"
                );
                Integrity::Mismatched
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not re-read file for verification");
                Integrity::NotChecked
            },
        }
    }

    /// Download `object` into `target` if there is no local copy, or the local
    /// copy is older and its content differs.
    #[instrument(skip(self, target, object), fields(key = %object.key))]
    pub async fn restore(&self, target: &Path, object: RemoteObject) -> TransferOutcome {
        let item = object.key.to_string();
        match self.restore_inner(target, object).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(item = %item, error = ?error, "restore failed");
                TransferOutcome::failed(item, error)
            },
        }
    }

    async fn restore_inner(&self, target: &Path, object: RemoteObject) -> Result<TransferOutcome> {
        self.check_cancelled()?;
        let key = object.key.clone();
        let item = key.to_string();
        let path = keymap::to_path(target, &key);

        let exists = self.fs.exists(&path).await.or_raise(|| ErrorKind::Transfer)?;
        let local_modified = if exists {
            Some(self.fs.last_modified(&path).await.or_raise(|| ErrorKind::Transfer)?)
        } else {
            None
        };

        // Listings don't carry fingerprints; fetch the full metadata at most
        // once, and only when it is needed.
        let mut recorded: Option<Option<StoredFingerprint>> = None;
        let decision = match decision::restore_check(&object, local_modified) {
            RestoreCheck::Decided(decision) => decision,
            RestoreCheck::CompareFingerprint => {
                let fingerprint = self.recorded_fingerprint(&key).await?;
                let matches = match &fingerprint {
                    Some(expected) => {
                        integrity::verify(self.fs.as_ref(), &path, expected).await.or_raise(|| ErrorKind::Transfer)?
                    },
                    // Nothing to compare against: assume the content differs.
                    None => false,
                };
                recorded = Some(fingerprint);
                decision::restore_after_compare(matches)
            },
        };
        tracing::debug!(key = %key, path = %path.display(), %decision, "restore decision");
        if decision.is_skip() {
            return Ok(TransferOutcome::skipped(item, decision.reason));
        }

        self.check_cancelled()?;
        let mode = match decision.action {
            Action::Create => CreationMode::CreateNew,
            _ => CreationMode::Overwrite,
        };
        let body = self.store.download(&key).await.or_raise(|| ErrorKind::Transfer)?;
        let written = match self.fs.write_from_stream(&path, body, mode).await {
            Ok(written) => written,
            Err(e) if mode == CreationMode::CreateNew && matches!(&*e, StorageErrorKind::AlreadyExists(_)) => {
                let TransferDecision { reason, .. } = decision::lost_race();
                tracing::warn!(path = %path.display(), "file appeared before it could be created; skipping");
                return Ok(TransferOutcome::skipped(item, reason));
            },
            Err(e) => return Err(e.raise(ErrorKind::Transfer)),
        };
        tracing::info!(key = %key, path = %path.display(), size = written, action = %decision.action, "downloaded");

        let recorded = match recorded {
            Some(recorded) => recorded,
            None => match self.recorded_fingerprint(&key).await {
                Ok(recorded) => recorded,
                Err(e) => {
                    tracing::warn!(key = %key, error = ?e, "could not read object metadata for verification");
                    None
                },
            },
        };
        let integrity = self.verify_local(&path, recorded.as_ref(), &key).await;
        Ok(TransferOutcome::succeeded(item, decision.action, integrity))
    }

    async fn recorded_fingerprint(&self, key: &ObjectKey) -> Result<Option<StoredFingerprint>> {
        let remote = self.store.metadata(key).await.or_raise(|| ErrorKind::Transfer)?;
        Ok(StoredFingerprint::of(&remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Reason;
    use crate::outcome::TransferResult;
    use async_trait::async_trait;
    use coffer_storage::backend::MemoryStore;
    use coffer_storage::local::LocalFileStream;
    use coffer_storage::{BoxAsyncRead, LocalFilesystem, LocalFs, ObjectMeta, ObjectStore};
    use std::num::NonZeroUsize;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use time::OffsetDateTime;

    /// Anything over 8 bytes goes up in 4-byte parts.
    const SMALL_PARTS: UploadOptions =
        UploadOptions { single_upload_threshold: 8, part_size: 4, parallel_parts: NonZeroUsize::MIN };

    fn worker(store: &Arc<MemoryStore>) -> TransferWorker {
        TransferWorker::new(
            Arc::clone(store) as StoreHandle,
            Arc::new(LocalFilesystem),
            UploadOptions::default(),
            CancellationToken::new(),
        )
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        std::fs::File::options().write(true).open(path).unwrap().set_modified(when).unwrap();
    }

    fn local_file(path: &Path) -> LocalFile {
        let metadata = std::fs::metadata(path).unwrap();
        LocalFile::new(path, metadata.len(), metadata.modified().unwrap().into())
    }

    #[tokio::test]
    async fn test_backup_creates_and_verifies() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let path = root.join("a.txt");
        std::fs::write(&path, b"hi").unwrap();
        let store = Arc::new(MemoryStore::default());

        let outcome = worker(&store).backup(&root, local_file(&path)).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Matched);
        assert_eq!(store.data("root/a.txt").await.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test]
    async fn test_backup_rejects_path_outside_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"hi").unwrap();
        let store = Arc::new(MemoryStore::default());

        let outcome = worker(&store).backup(Path::new("/somewhere/else"), local_file(&path)).await;
        let TransferResult::Failed(error) = outcome.result else { panic!("expected failure") };
        assert!(matches!(&*error, ErrorKind::PathMapping(_)));
        assert_eq!(store.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_backup_cancelled_before_transfer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let path = root.join("a.txt");
        std::fs::write(&path, b"hi").unwrap();
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = TransferWorker::new(store.clone(), Arc::new(LocalFilesystem), UploadOptions::default(), cancel);

        let outcome = worker.backup(&root, local_file(&path)).await;
        let TransferResult::Failed(error) = outcome.result else { panic!("expected failure") };
        assert!(matches!(&*error, ErrorKind::Cancelled));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_stale_local_with_same_content_skips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        std::fs::create_dir(&target).unwrap();
        let path = target.join("a.txt");
        std::fs::write(&path, b"same").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let store = Arc::new(MemoryStore::default());
        store.put("root/a.txt", b"same".to_vec(), OffsetDateTime::now_utc()).await;
        let object = store.metadata(&ObjectKey::parse("root/a.txt").unwrap()).await.unwrap();

        let outcome = worker(&store).restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Skipped(Reason::LocalStaleContentSame)));
        assert_eq!(std::fs::read(&path).unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_restore_stale_local_with_different_content_overwrites() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        std::fs::create_dir(&target).unwrap();
        let path = target.join("a.txt");
        std::fs::write(&path, b"old and longer").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let store = Arc::new(MemoryStore::default());
        store.put("root/a.txt", b"new".to_vec(), OffsetDateTime::now_utc()).await;
        let object = store.metadata(&ObjectKey::parse("root/a.txt").unwrap()).await.unwrap();

        let outcome = worker(&store).restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Overwrite)));
        assert_eq!(outcome.integrity, Integrity::Matched);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    /// Reports every path as missing, so a create-new write can collide with
    /// a file that is actually there.
    struct StaleExistsFs;

    #[async_trait]
    impl LocalFs for StaleExistsFs {
        fn enumerate<'a>(&'a self, _root: &'a Path) -> LocalFileStream<'a> {
            Box::pin(futures::stream::empty())
        }
        async fn open_read(&self, path: &Path) -> coffer_storage::error::Result<BoxAsyncRead> {
            LocalFilesystem.open_read(path).await
        }
        async fn exists(&self, _path: &Path) -> coffer_storage::error::Result<bool> {
            Ok(false)
        }
        async fn is_dir(&self, path: &Path) -> coffer_storage::error::Result<bool> {
            LocalFilesystem.is_dir(path).await
        }
        async fn last_modified(&self, path: &Path) -> coffer_storage::error::Result<OffsetDateTime> {
            LocalFilesystem.last_modified(path).await
        }
        async fn write_from_stream(
            &self,
            path: &Path,
            body: BoxAsyncRead,
            mode: CreationMode,
        ) -> coffer_storage::error::Result<u64> {
            LocalFilesystem.write_from_stream(path, body, mode).await
        }
    }

    #[tokio::test]
    async fn test_restore_lost_race_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        std::fs::create_dir(&target).unwrap();
        let path = target.join("a.txt");
        std::fs::write(&path, b"concurrent").unwrap();
        let store = Arc::new(MemoryStore::default());
        store.put("root/a.txt", b"remote".to_vec(), OffsetDateTime::now_utc()).await;
        let object = store.metadata(&ObjectKey::parse("root/a.txt").unwrap()).await.unwrap();
        let worker =
            TransferWorker::new(store.clone(), Arc::new(StaleExistsFs), UploadOptions::default(), CancellationToken::new());

        let outcome = worker.restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Skipped(Reason::LostRace)));
        assert_eq!(std::fs::read(&path).unwrap(), b"concurrent");
    }

    #[tokio::test]
    async fn test_restore_missing_fingerprint_counts_as_different() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        std::fs::create_dir(&target).unwrap();
        let path = target.join("a.txt");
        std::fs::write(&path, b"same").unwrap();
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let store = Arc::new(MemoryStore::default());
        store.put("root/a.txt", b"same".to_vec(), OffsetDateTime::now_utc()).await;
        store.forget_fingerprint("root/a.txt").await;
        let object = store.metadata(&ObjectKey::parse("root/a.txt").unwrap()).await.unwrap();

        let outcome = worker(&store).restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Overwrite)));
        assert_eq!(outcome.integrity, Integrity::NotChecked);
    }

    #[tokio::test]
    async fn test_restore_creates_parent_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        let store = Arc::new(MemoryStore::default());
        store.put("root/nested/deeper/a.txt", b"data".to_vec(), OffsetDateTime::now_utc()).await;
        let object = RemoteObject::present(
            ObjectKey::parse("root/nested/deeper/a.txt").unwrap(),
            ObjectMeta { modified: OffsetDateTime::now_utc(), size: 4, fingerprint: None, part_size: None },
        );

        let outcome = worker(&store).restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Matched);
        assert_eq!(std::fs::read(target.join("nested/deeper/a.txt")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_backup_detects_store_keeping_different_bytes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let path = root.join("a.txt");
        std::fs::write(&path, b"precious").unwrap();
        let store = Arc::new(MemoryStore::default());
        store.corrupt_uploads();

        let outcome = worker(&store).backup(&root, local_file(&path)).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Mismatched);
    }

    #[tokio::test]
    async fn test_restore_corrupted_download_raises_alarm() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("root");
        std::fs::create_dir(&target).unwrap();
        let store =
            Arc::new(MemoryStore::with_objects([("root/a.txt", "precious")]).with_corrupted_download("root/a.txt"));
        let object = store.metadata(&ObjectKey::parse("root/a.txt").unwrap()).await.unwrap();

        let outcome = worker(&store).restore(&target, object).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Mismatched);
        assert_ne!(std::fs::read(target.join("a.txt")).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_multipart_backup_and_restore_verify() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let path = root.join("big.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let store = Arc::new(MemoryStore::default());
        let worker = TransferWorker::new(store.clone(), Arc::new(LocalFilesystem), SMALL_PARTS, CancellationToken::new());

        let outcome = worker.backup(&root, local_file(&path)).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Matched);

        // A stale local copy with the same content is recognised through the
        // composite fingerprint.
        set_mtime(&path, SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let object = store.metadata(&ObjectKey::parse("root/big.bin").unwrap()).await.unwrap();
        let outcome = worker.restore(&root, object.clone()).await;
        assert!(matches!(outcome.result, TransferResult::Skipped(Reason::LocalStaleContentSame)));

        let restore_dir = tempfile::tempdir().unwrap();
        let outcome = worker.restore(restore_dir.path(), object).await;
        assert!(matches!(outcome.result, TransferResult::Succeeded(Action::Create)));
        assert_eq!(outcome.integrity, Integrity::Matched);
    }
}
