//! Backup and restore between a local directory tree and an object store.
//!
//! Leaves first: [`keymap`] maps paths to keys and back, [`integrity`]
//! fingerprints content, [`decision`] picks create/overwrite/skip from
//! metadata alone, [`TransferWorker`] carries out one decision, the
//! [`walker`] enumerates the remote side, and the [`SyncEngine`] pushes
//! everything through a [`BoundedPipeline`] and tallies a [`RunSummary`].

pub mod decision;
mod engine;
pub mod error;
pub mod integrity;
pub mod keymap;
mod outcome;
mod pipeline;
mod transfer;
pub mod walker;

pub use crate::decision::{Action, Reason, TransferDecision};
pub use crate::engine::SyncEngine;
pub use crate::integrity::Integrity;
pub use crate::outcome::{Failure, RunSummary, TransferOutcome, TransferResult};
pub use crate::pipeline::{BoundedPipeline, PipelineOptions};
pub use crate::transfer::TransferWorker;
