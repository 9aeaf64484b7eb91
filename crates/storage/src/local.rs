//! Local filesystem capability.
//!
//! The sync engine never touches `std::fs`/`tokio::fs` directly; everything
//! goes through [`LocalFs`] so tests can substitute a double and the walker
//! and writer semantics live in one place. [`LocalFilesystem`] is the real
//! implementation on top of `tokio::fs`.

use crate::error::{ErrorKind, Result};
use crate::{BoxAsyncRead, LocalFile};
use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use time::OffsetDateTime;
use tokio::fs::{self, DirEntry, OpenOptions};

pub type LocalFileStream<'a> = Pin<Box<dyn Stream<Item = Result<LocalFile>> + Send + 'a>>;

/// How [`LocalFs::write_from_stream`] treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMode {
    /// Fail with [`AlreadyExists`](ErrorKind::AlreadyExists) if the file is
    /// already there (detects a concurrent creator).
    CreateNew,
    /// Truncate and replace any existing file.
    Overwrite,
}

enum WalkEntry {
    File(LocalFile),
    Descend(PathBuf),
    Skip,
}

/// Filesystem operations needed by the sync engine.
///
/// All paths are absolute.
#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Recursively enumerate regular files under `root`.
    ///
    /// Entries are yielded as they are discovered; an unreadable directory
    /// yields an error item and the walk carries on with its siblings.
    fn enumerate<'a>(&'a self, root: &'a Path) -> LocalFileStream<'a>;

    /// Open a file for streaming reads.
    async fn open_read(&self, path: &Path) -> Result<BoxAsyncRead>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Check that `path` exists and is a directory.
    async fn is_dir(&self, path: &Path) -> Result<bool>;

    /// Last modification time of a file, in UTC.
    async fn last_modified(&self, path: &Path) -> Result<OffsetDateTime>;

    /// Stream `body` into `path`, creating parent directories as needed.
    ///
    /// Returns the number of bytes written.
    async fn write_from_stream(&self, path: &Path, body: BoxAsyncRead, mode: CreationMode) -> Result<u64>;
}

/// [`LocalFs`] backed by the real filesystem via `tokio::fs`.
///
/// # Examples
///
/// ```no_run
/// use coffer_storage::{LocalFilesystem, LocalFs};
/// use futures::TryStreamExt;
/// use std::path::Path;
///
/// # async fn example() -> coffer_storage::error::Result<()> {
/// let fs = LocalFilesystem;
/// let files: Vec<_> = fs.enumerate(Path::new("/srv/photos")).try_collect().await?;
/// println!("{} files", files.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    fn require_absolute(path: &Path) -> Result<()> {
        if !path.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        }
        Ok(())
    }

    fn describe(path: PathBuf, metadata: &Metadata) -> Result<LocalFile> {
        let modified = metadata.modified().map_err(|e| ErrorKind::from_io(e, &path))?.into();
        Ok(LocalFile::new(path, metadata.len(), modified))
    }

    /// Keeps the `?`-able logic out of the `stream!` loop, where errors have
    /// to be yielded rather than propagated.
    async fn process_entry(entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        if file_type.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        // Follow symlinks to files, but never descend through symlinked
        // directories (cycles).
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            // Note: silently drop what is most likely a broken symlink.
            Err(e) if file_type.is_symlink() && e.kind() == std::io::ErrorKind::NotFound => return Ok(WalkEntry::Skip),
            Err(e) => exn::bail!(ErrorKind::from_io(e, &path)),
        };
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::describe(path, &metadata)?));
        }
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl LocalFs for LocalFilesystem {
    fn enumerate<'a>(&'a self, root: &'a Path) -> LocalFileStream<'a> {
        if let Err(e) = Self::require_absolute(root) {
            return Box::pin(futures::stream::once(async { Err(e) }));
        }
        let mut stack = vec![root.to_path_buf()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::from_io(e, &current))); continue 'entries; },
                    };
                    match Self::process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn open_read(&self, path: &Path) -> Result<BoxAsyncRead> {
        Self::require_absolute(path)?;
        let file = fs::File::open(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(Box::pin(file))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Self::require_absolute(path)?;
        Ok(fs::try_exists(path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn is_dir(&self, path: &Path) -> Result<bool> {
        Self::require_absolute(path)?;
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => exn::bail!(ErrorKind::from_io(e, path)),
        }
    }

    async fn last_modified(&self, path: &Path) -> Result<OffsetDateTime> {
        Self::require_absolute(path)?;
        let metadata = fs::metadata(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(metadata.modified().map_err(|e| ErrorKind::from_io(e, path))?.into())
    }

    async fn write_from_stream(&self, path: &Path, mut body: BoxAsyncRead, mode: CreationMode) -> Result<u64> {
        Self::require_absolute(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
        }
        let mut options = OpenOptions::new();
        options.write(true);
        match mode {
            CreationMode::CreateNew => options.create_new(true),
            CreationMode::Overwrite => options.create(true).truncate(true),
        };
        let mut file = options.open(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let written = tokio::io::copy(&mut body, &mut file).await.map_err(|e| ErrorKind::from_io(e, path))?;
        file.sync_all().await.map_err(|e| ErrorKind::from_io(e, path))?;
        Ok(written)
    }
}
