mod cli;
mod error;
mod logging;

use crate::cli::Cli;
use crate::error::{ErrorKind, Result};
use clap::Parser;
use coffer_config::Config;
use coffer_storage::backend::S3Store;
use coffer_storage::{FsHandle, LocalFilesystem, StoreHandle};
use coffer_sync::{PipelineOptions, RunSummary, SyncEngine};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Some items failed; the rest of the run completed.
const EXIT_PARTIAL_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; finishing in-flight transfers");
                cancel.cancel();
            }
        }
    });

    match run(&cli, cancel).await {
        Ok(summary) if summary.has_failures() => {
            for failure in &summary.failures {
                tracing::error!(item = %failure.item, error = %failure.error, "failed");
            }
            ExitCode::from(EXIT_PARTIAL_FAILURE)
        },
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "{e}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: &Cli, cancel: CancellationToken) -> Result<RunSummary> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    config.validate().or_raise(|| ErrorKind::Config)?;
    let directories = resolve_directories(cli, &config).await?;

    let upload = config.upload.to_options().or_raise(|| ErrorKind::Config)?;
    let pipeline =
        PipelineOptions::new(config.pipeline.capacity, config.pipeline.workers).or_raise(|| ErrorKind::Config)?;
    let storage = &config.storage;
    let store: StoreHandle = Arc::new(S3Store::new(
        storage.bucket.clone(),
        storage.region.clone(),
        storage.endpoint.clone(),
        storage.key_id.clone(),
        storage.key_secret.clone(),
        storage.max_requests,
    ));
    let fs: FsHandle = Arc::new(LocalFilesystem);
    let engine = SyncEngine::new(store, fs, pipeline, upload, cancel.clone());

    if cli.restore {
        let target = &directories[0];
        let span = tracing::info_span!("run", mode = "restore", root = %target.display());
        return engine.restore(target).instrument(span).await.or_raise(|| ErrorKind::Run("restore"));
    }

    let mut total = RunSummary::default();
    for root in &directories {
        if cancel.is_cancelled() {
            tracing::warn!(root = %root.display(), "cancelled; root not processed");
            continue;
        }
        let span = tracing::info_span!("run", mode = "backup", root = %root.display());
        let summary = engine.backup(root).instrument(span).await.or_raise(|| ErrorKind::Run("backup"))?;
        total.merge(summary);
    }
    if directories.len() > 1 {
        tracing::info!(roots = directories.len(), summary = %total, "all roots processed");
    }
    Ok(total)
}

/// Pick the directories for this run and check every one of them before any
/// transfer starts.
async fn resolve_directories(cli: &Cli, config: &Config) -> Result<Vec<PathBuf>> {
    let directories = cli.directories_or(&config.sources);
    if directories.is_empty() {
        exn::bail!(ErrorKind::Usage("no directory given and no sources configured".to_string()));
    }
    if cli.restore && directories.len() != 1 {
        exn::bail!(ErrorKind::Usage(format!("restore needs exactly one target directory, got {}", directories.len())));
    }
    let mut resolved = Vec::with_capacity(directories.len());
    for directory in &directories {
        resolved.push(resolve_directory(directory).await?);
    }
    Ok(resolved)
}

async fn resolve_directory(directory: &Path) -> Result<PathBuf> {
    let not_usable = || ErrorKind::Usage(format!("not an accessible directory: {}", directory.display()));
    let resolved = tokio::fs::canonicalize(directory).await.or_raise(not_usable)?;
    let metadata = tokio::fs::metadata(&resolved).await.or_raise(not_usable)?;
    if !metadata.is_dir() {
        exn::bail!(not_usable());
    }
    Ok(resolved)
}
