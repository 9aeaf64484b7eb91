//! Bounded work queue drained by a fixed pool of workers.
//!
//! The producer awaits in [`BoundedPipeline::submit`] while the queue is
//! full, so memory stays proportional to `capacity + workers` no matter how
//! many items are produced.

use crate::error::{ErrorKind, Result};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Maximum number of submitted items not yet picked up by a worker.
    pub capacity: NonZeroUsize,
    pub workers: NonZeroUsize,
}
impl PipelineOptions {
    /// Both values must be positive.
    pub fn new(capacity: usize, workers: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| ErrorKind::Configuration("pipeline capacity must be positive".to_string()))?;
        let workers = NonZeroUsize::new(workers)
            .ok_or_else(|| ErrorKind::Configuration("pipeline worker count must be positive".to_string()))?;
        Ok(Self { capacity, workers })
    }
}

pub struct BoundedPipeline<T> {
    sender: mpsc::Sender<T>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> BoundedPipeline<T> {
    /// Spawn the worker pool. Every submitted item is passed to `handler`
    /// exactly once, by whichever worker dequeues it first.
    ///
    /// Items already queued when `cancel` fires are still handed out; the
    /// handler is expected to check the token itself before doing any I/O.
    pub fn start<F, Fut>(options: PipelineOptions, cancel: CancellationToken, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(options.capacity.get());
        let receiver = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);
        let mut workers = JoinSet::new();
        for worker in 0..options.workers.get() {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            workers.spawn(async move {
                loop {
                    // Release the lock before handling so the other workers
                    // can dequeue in the meantime.
                    let item = receiver.lock().await.recv().await;
                    let Some(item) = item else { break };
                    handler(item).await;
                }
                tracing::trace!(worker, "pipeline worker finished");
            });
        }
        Self { sender, workers, cancel }
    }

    /// Enqueue an item, waiting for space if the queue is full.
    ///
    /// Fails with [`Cancelled`](ErrorKind::Cancelled) once the run has been
    /// cancelled; nothing more should be produced after that.
    pub async fn submit(&self, item: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
            sent = self.sender.send(item) => {
                if sent.is_err() {
                    exn::bail!(ErrorKind::PipelineClosed);
                }
                Ok(())
            },
        }
    }

    /// Signal that no more items will arrive, then wait until every queued
    /// item has been handled.
    pub async fn complete(self) {
        let Self { sender, mut workers, .. } = self;
        drop(sender);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "pipeline worker panicked");
            }
        }
    }
}
