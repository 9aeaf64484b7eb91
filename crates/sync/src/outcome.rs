//! Per-item outcomes and their per-run aggregate.

use crate::decision::{Action, Reason};
use crate::error::Error;
use crate::integrity::Integrity;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to a single item.
#[derive(Debug)]
pub enum TransferResult {
    /// Transferred; [`Action::Create`] or [`Action::Overwrite`].
    Succeeded(Action),
    Skipped(Reason),
    Failed(Error),
}

/// Outcome of one file (backup) or object (restore).
#[derive(Debug)]
pub struct TransferOutcome {
    /// Local path or object key.
    pub item: String,
    pub result: TransferResult,
    pub integrity: Integrity,
}
impl TransferOutcome {
    pub fn succeeded(item: impl Into<String>, action: Action, integrity: Integrity) -> Self {
        Self { item: item.into(), result: TransferResult::Succeeded(action), integrity }
    }

    pub fn skipped(item: impl Into<String>, reason: Reason) -> Self {
        Self { item: item.into(), result: TransferResult::Skipped(reason), integrity: Integrity::NotChecked }
    }

    pub fn failed(item: impl Into<String>, error: Error) -> Self {
        Self { item: item.into(), result: TransferResult::Failed(error), integrity: Integrity::NotChecked }
    }
}

/// A failed item and its cause.
#[derive(Debug)]
pub struct Failure {
    pub item: String,
    pub error: Error,
}

/// Counts and failures accumulated over one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub created: u64,
    pub overwritten: u64,
    pub skipped: u64,
    pub failed: u64,
    pub failures: Vec<Failure>,
    /// Items that transferred but failed post-transfer verification.
    pub integrity_alarms: Vec<String>,
}

impl RunSummary {
    pub fn record(&mut self, outcome: TransferOutcome) {
        if outcome.integrity == Integrity::Mismatched {
            self.integrity_alarms.push(outcome.item.clone());
        }
        match outcome.result {
            TransferResult::Succeeded(Action::Create) => self.created += 1,
            TransferResult::Succeeded(Action::Overwrite) => self.overwritten += 1,
            TransferResult::Succeeded(Action::Skip) | TransferResult::Skipped(_) => self.skipped += 1,
            TransferResult::Failed(error) => {
                self.failed += 1;
                self.failures.push(Failure { item: outcome.item, error });
            },
        }
    }

    /// Merge another summary into this one.
    pub fn merge(&mut self, other: Self) {
        self.created += other.created;
        self.overwritten += other.overwritten;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self.integrity_alarms.extend(other.integrity_alarms);
    }

    /// Items actually transferred.
    pub fn succeeded(&self) -> u64 {
        self.created + self.overwritten
    }

    pub fn total(&self) -> u64 {
        self.succeeded() + self.skipped + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} overwritten, {} skipped, {} failed, {} integrity alarms",
            self.created,
            self.overwritten,
            self.skipped,
            self.failed,
            self.integrity_alarms.len()
        )
    }
}

pub type OutcomeSender = mpsc::UnboundedSender<TransferOutcome>;

/// Spawn the single consumer that folds outcomes into a [`RunSummary`].
///
/// The summary is returned once every sender clone has been dropped.
pub fn collector() -> (OutcomeSender, JoinHandle<RunSummary>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut summary = RunSummary::default();
        while let Some(outcome) = rx.recv().await {
            summary.record(outcome);
        }
        summary
    });
    (tx, handle)
}
