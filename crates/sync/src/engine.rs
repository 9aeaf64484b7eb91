//! Run orchestration.

use crate::error::{ErrorKind, Result};
use crate::outcome::{self, RunSummary, TransferOutcome};
use crate::pipeline::{BoundedPipeline, PipelineOptions};
use crate::transfer::TransferWorker;
use crate::walker;
use coffer_storage::{FsHandle, LocalFile, RemoteObject, StoreHandle, UploadOptions};
use exn::ResultExt;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Drives whole backup and restore runs.
///
/// Items are fed through a [`BoundedPipeline`] to [`TransferWorker`]s and
/// every outcome lands in a [`RunSummary`]. A run only returns an error for
/// problems found before any work starts; everything after that is recorded
/// per item.
pub struct SyncEngine {
    store: StoreHandle,
    fs: FsHandle,
    pipeline: PipelineOptions,
    upload: UploadOptions,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        store: StoreHandle,
        fs: FsHandle,
        pipeline: PipelineOptions,
        upload: UploadOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self { store, fs, pipeline, upload, cancel }
    }

    fn worker(&self) -> TransferWorker {
        TransferWorker::new(Arc::clone(&self.store), Arc::clone(&self.fs), self.upload, self.cancel.clone())
    }

    async fn require_directory(&self, path: &Path) -> Result<()> {
        let is_dir = self
            .fs
            .is_dir(path)
            .await
            .or_raise(|| ErrorKind::Configuration(format!("cannot access {}", path.display())))?;
        if !is_dir {
            exn::bail!(ErrorKind::Configuration(format!("not a directory: {}", path.display())));
        }
        Ok(())
    }

    /// Upload every new or changed file below `root`.
    #[instrument(skip(self), fields(container = self.store.name()))]
    pub async fn backup(&self, root: &Path) -> Result<RunSummary> {
        self.require_directory(root).await?;
        let (outcomes, collector) = outcome::collector();

        let pipeline = {
            let worker = self.worker();
            let outcomes = outcomes.clone();
            let root: Arc<PathBuf> = Arc::new(root.to_path_buf());
            BoundedPipeline::start(self.pipeline, self.cancel.clone(), move |file: LocalFile| {
                let (worker, outcomes, root) = (worker.clone(), outcomes.clone(), Arc::clone(&root));
                async move {
                    let _ = outcomes.send(worker.backup(&root, file).await);
                }
            })
        };

        let mut files = self.fs.enumerate(root);
        while let Some(file) = files.next().await {
            match file {
                Ok(file) => {
                    if let Err(e) = pipeline.submit(file).await {
                        tracing::warn!(error = %e, "no longer accepting files");
                        break;
                    }
                },
                Err(e) => {
                    let item = (*e).path().unwrap_or(root).display().to_string();
                    tracing::error!(item = %item, error = %e, "could not enumerate part of the tree");
                    let _ = outcomes.send(TransferOutcome::failed(item, e.raise(ErrorKind::Enumeration)));
                },
            }
        }
        drop(files);

        self.finish("backup", pipeline, outcomes, collector).await
    }

    /// Download every object in the container that is missing or stale below
    /// `target`.
    #[instrument(skip(self), fields(container = self.store.name()))]
    pub async fn restore(&self, target: &Path) -> Result<RunSummary> {
        self.require_directory(target).await?;
        let (outcomes, collector) = outcome::collector();

        let pipeline = {
            let worker = self.worker();
            let outcomes = outcomes.clone();
            let target: Arc<PathBuf> = Arc::new(target.to_path_buf());
            BoundedPipeline::start(self.pipeline, self.cancel.clone(), move |object: RemoteObject| {
                let (worker, outcomes, target) = (worker.clone(), outcomes.clone(), Arc::clone(&target));
                async move {
                    let _ = outcomes.send(worker.restore(&target, object).await);
                }
            })
        };

        {
            let mut objects = std::pin::pin!(walker::walk(self.store.as_ref(), None, &self.cancel));
            while let Some(object) = objects.next().await {
                match object {
                    Ok(object) => {
                        if let Err(e) = pipeline.submit(object).await {
                            tracing::warn!(error = %e, "no longer accepting objects");
                            break;
                        }
                    },
                    Err(failure) => {
                        let _ = outcomes.send(TransferOutcome::failed(failure.item, failure.error));
                    },
                }
            }
        }

        self.finish("restore", pipeline, outcomes, collector).await
    }

    async fn finish<T: Send + 'static>(
        &self,
        mode: &str,
        pipeline: BoundedPipeline<T>,
        outcomes: outcome::OutcomeSender,
        collector: tokio::task::JoinHandle<RunSummary>,
    ) -> Result<RunSummary> {
        pipeline.complete().await;
        drop(outcomes);
        let summary = collector.await.or_raise(|| ErrorKind::PipelineClosed)?;
        if self.cancel.is_cancelled() {
            tracing::warn!(mode, %summary, "run cancelled; summary is partial");
        } else {
            tracing::info!(mode, %summary, "run finished");
        }
        for alarm in &summary.integrity_alarms {
            tracing::error!(mode, item = %alarm, "integrity alarm");
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::fingerprint;
    use coffer_storage::backend::MemoryStore;
    use coffer_storage::{LocalFilesystem, ObjectStore};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn engine(store: &Arc<MemoryStore>, capacity: usize, workers: usize) -> SyncEngine {
        SyncEngine::new(
            Arc::clone(store) as StoreHandle,
            Arc::new(LocalFilesystem),
            PipelineOptions::new(capacity, workers).unwrap(),
            UploadOptions::default(),
            CancellationToken::new(),
        )
    }

    fn source_tree() -> (TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        (temp_dir, root)
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        std::fs::File::options().write(true).open(path).unwrap().set_modified(when).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backup_create_skip_overwrite() {
        let (_temp_dir, root) = source_tree();
        let file = root.join("a.txt");
        std::fs::write(&file, b"hi").unwrap();
        set_mtime(&file, SystemTime::now() - Duration::from_secs(3600));
        let store = Arc::new(MemoryStore::default());
        let engine = engine(&store, 4, 2);

        let first = engine.backup(&root).await.unwrap();
        assert_eq!((first.created, first.overwritten, first.skipped, first.failed), (1, 0, 0, 0));
        assert!(first.integrity_alarms.is_empty());
        let key = coffer_storage::ObjectKey::parse("root/a.txt").unwrap();
        let remote = store.metadata(&key).await.unwrap();
        assert_eq!(remote.fingerprint(), Some(fingerprint(b"hi").as_str()));

        // Unchanged: the remote copy is newer than the local file.
        let second = engine.backup(&root).await.unwrap();
        assert_eq!((second.created, second.overwritten, second.skipped), (0, 0, 1));
        assert_eq!(store.upload_count(), 1);

        // Same content, but touched after the upload.
        set_mtime(&file, SystemTime::now() + Duration::from_secs(3600));
        let third = engine.backup(&root).await.unwrap();
        assert_eq!((third.created, third.overwritten, third.skipped), (0, 1, 0));
        assert!(third.integrity_alarms.is_empty());
        assert_eq!(store.upload_count(), 2);
        assert_eq!(store.data("root/a.txt").await.as_deref(), Some(&b"hi"[..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_failed_upload_does_not_stop_the_run() {
        let (_temp_dir, root) = source_tree();
        std::fs::create_dir(root.join("sub")).unwrap();
        for i in 0..10 {
            let dir = if i % 2 == 0 { root.clone() } else { root.join("sub") };
            std::fs::write(dir.join(format!("file-{i}.txt")), format!("content {i}")).unwrap();
        }
        let store = Arc::new(MemoryStore::default().with_failing_upload("root/sub/file-3.txt"));
        let summary = engine(&store, 2, 3).backup(&root).await.unwrap();

        assert_eq!(summary.succeeded(), 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].item, root.join("sub/file-3.txt").display().to_string());
        assert!(matches!(&*summary.failures[0].error, ErrorKind::Transfer));
        assert_eq!(store.len().await, 9);
    }

    #[tokio::test]
    async fn test_corrupted_upload_raises_integrity_alarm() {
        let (_temp_dir, root) = source_tree();
        std::fs::write(root.join("a.txt"), b"precious").unwrap();
        let store = Arc::new(MemoryStore::default());
        store.corrupt_uploads();

        let summary = engine(&store, 1, 1).backup(&root).await.unwrap();
        // Still counted as transferred, but flagged.
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.integrity_alarms, vec![root.join("a.txt").display().to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_enumeration_failure_is_recorded_against_its_path() {
        let (_temp_dir, root) = source_tree();
        std::fs::write(root.join("ok.txt"), b"ok").unwrap();
        std::os::unix::fs::symlink(root.join("loop"), root.join("loop")).unwrap();
        let store = Arc::new(MemoryStore::default());

        let summary = engine(&store, 2, 1).backup(&root).await.unwrap();
        assert_eq!((summary.created, summary.failed), (1, 1));
        assert_eq!(summary.failures[0].item, root.join("loop").display().to_string());
        assert!(matches!(&*summary.failures[0].error, ErrorKind::Enumeration));
    }

    #[tokio::test]
    async fn test_corrupted_download_raises_integrity_alarm() {
        let target = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MemoryStore::with_objects([("root/ok.txt", "ok"), ("root/bad.txt", "precious")])
                .with_corrupted_download("root/bad.txt"),
        );

        let summary = engine(&store, 2, 2).restore(target.path()).await.unwrap();
        // Both count as transferred; the damaged one is flagged, not failed.
        assert_eq!((summary.created, summary.failed), (2, 0));
        assert_eq!(summary.integrity_alarms, vec!["root/bad.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_root_is_a_configuration_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let err = engine(&store, 1, 1).backup(&temp_dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));
        let err = engine(&store, 1, 1).restore(&temp_dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Configuration(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restore_into_doubled_target() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("backup").join("backup");
        std::fs::create_dir_all(&target).unwrap();
        let store = Arc::new(MemoryStore::with_objects([
            ("backup/file.txt", "top"),
            ("backup/docs/notes.txt", "nested"),
        ]));

        let summary = engine(&store, 4, 2).restore(&target).await.unwrap();
        assert_eq!((summary.created, summary.failed), (2, 0));
        assert!(summary.integrity_alarms.is_empty());
        let base = temp_dir.path().join("backup");
        assert_eq!(std::fs::read(base.join("file.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(base.join("docs/notes.txt")).unwrap(), b"nested");
        assert!(!target.join("backup").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backup_then_restore_round_trip() {
        let (_source_dir, root) = source_tree();
        std::fs::create_dir_all(root.join("x/y")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("x/b.txt"), b"b").unwrap();
        std::fs::write(root.join("x/y/c.txt"), b"c").unwrap();
        let store = Arc::new(MemoryStore::default().with_page_size(2));
        let backup = engine(&store, 2, 2).backup(&root).await.unwrap();
        assert_eq!(backup.created, 3);

        let restore_dir = tempfile::tempdir().unwrap();
        let restored = engine(&store, 2, 2).restore(restore_dir.path()).await.unwrap();
        assert_eq!(restored.created, 3);
        for (relative, content) in [("a.txt", "a"), ("x/b.txt", "b"), ("x/y/c.txt", "c")] {
            let path = restore_dir.path().join("root").join(relative);
            assert_eq!(std::fs::read_to_string(path).unwrap(), content);
        }

        // Restored files are newer than the objects, so nothing happens again.
        let again = engine(&store, 2, 2).restore(restore_dir.path()).await.unwrap();
        assert_eq!((again.created, again.overwritten, again.skipped), (0, 0, 3));
    }

    #[tokio::test]
    async fn test_restore_records_listing_failure() {
        let target = tempfile::tempdir().unwrap();
        let store = Arc::new(
            MemoryStore::with_objects([("root/ok.txt", "ok"), ("root/bad/lost.txt", "lost")])
                .with_failing_listing("root/bad/"),
        );
        let summary = engine(&store, 2, 1).restore(target.path()).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.failed, 1);
        assert!(matches!(&*summary.failures[0].error, ErrorKind::Listing(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_partial_summary() {
        let (_temp_dir, root) = source_tree();
        for i in 0..5 {
            std::fs::write(root.join(format!("{i}.txt")), b"x").unwrap();
        }
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(LocalFilesystem),
            PipelineOptions::new(1, 1).unwrap(),
            UploadOptions::default(),
            cancel,
        );
        let summary = engine.backup(&root).await.unwrap();
        assert_eq!(summary.succeeded(), 0);
        assert!(store.is_empty().await);
    }
}
