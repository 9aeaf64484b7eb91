//! Transfer decisions.
//!
//! Pure functions of local and remote metadata; nothing here performs I/O.
//! Timestamps come from two different clocks (the local filesystem and the
//! storage service) and no skew compensation is attempted: a local file whose
//! clock lags the service's can be skipped even though its content differs.

use coffer_storage::{LocalFile, RemoteObject};
use derive_more::Display;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Action {
    #[display("create")]
    Create,
    #[display("overwrite")]
    Overwrite,
    #[display("skip")]
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Reason {
    /// Backup: nothing stored under the key yet.
    #[display("no remote object")]
    NoRemoteObject,
    /// Backup: the local file was modified after the remote copy.
    #[display("remote is stale")]
    RemoteStale,
    /// Backup: the remote copy is at least as recent as the local file.
    #[display("remote is current")]
    RemoteCurrent,
    /// Restore: nothing at the local path yet.
    #[display("no local file")]
    NoLocalFile,
    /// Restore: the local file is older and its content differs.
    #[display("local is stale and content differs")]
    LocalStaleContentDiffers,
    /// Restore: the local file is older but already has the same content.
    #[display("local is stale but content is the same")]
    LocalStaleContentSame,
    /// Restore: the local file is at least as recent as the remote object.
    #[display("local is current")]
    LocalCurrent,
    /// Restore: another writer created the local file between the decision
    /// and the write.
    #[display("lost creation race")]
    LostRace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{action} ({reason})")]
pub struct TransferDecision {
    pub action: Action,
    pub reason: Reason,
}
impl TransferDecision {
    const fn new(action: Action, reason: Reason) -> Self {
        Self { action, reason }
    }

    pub fn is_skip(&self) -> bool {
        self.action == Action::Skip
    }
}

/// Decide whether `local` needs uploading over `remote`.
///
/// Only timestamps are compared: a newer local file is always re-uploaded,
/// even if its content turns out to be identical.
pub fn decide_backup(local: &LocalFile, remote: &RemoteObject) -> TransferDecision {
    match remote.modified() {
        None => TransferDecision::new(Action::Create, Reason::NoRemoteObject),
        Some(remote_modified) if local.modified > remote_modified => {
            TransferDecision::new(Action::Overwrite, Reason::RemoteStale)
        },
        Some(_) => TransferDecision::new(Action::Skip, Reason::RemoteCurrent),
    }
}

/// First step of a restore decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreCheck {
    Decided(TransferDecision),
    /// The local file is older than the remote object: whether to download
    /// depends on the content, see [`restore_after_compare`].
    CompareFingerprint,
}

/// Decide whether `remote` needs downloading, given the modification time of
/// the local file at its target path (`None` if there is no file).
pub fn restore_check(remote: &RemoteObject, local_modified: Option<OffsetDateTime>) -> RestoreCheck {
    let Some(local_modified) = local_modified else {
        return RestoreCheck::Decided(TransferDecision::new(Action::Create, Reason::NoLocalFile));
    };
    match remote.modified() {
        Some(remote_modified) if local_modified < remote_modified => RestoreCheck::CompareFingerprint,
        _ => RestoreCheck::Decided(TransferDecision::new(Action::Skip, Reason::LocalCurrent)),
    }
}

/// Second step of a restore decision, once the stale local file has been
/// fingerprinted and compared against the remote one.
pub fn restore_after_compare(content_matches: bool) -> TransferDecision {
    if content_matches {
        TransferDecision::new(Action::Skip, Reason::LocalStaleContentSame)
    } else {
        TransferDecision::new(Action::Overwrite, Reason::LocalStaleContentDiffers)
    }
}

/// Outcome of a create-new write that found the file already there.
pub fn lost_race() -> TransferDecision {
    TransferDecision::new(Action::Skip, Reason::LostRace)
}
