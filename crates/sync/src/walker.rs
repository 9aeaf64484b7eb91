//! Depth-first enumeration of a remote container.
//!
//! The container is listed one `/`-delimited level at a time. Every virtual
//! directory is descended into before the rest of the page it appeared on,
//! and every level is paged until the store reports no continuation token.

use crate::error::ErrorKind;
use crate::outcome::Failure;
use async_stream::stream;
use coffer_storage::{ListEntry, ObjectStore, RemoteObject};
use futures::Stream;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

struct Frame {
    prefix: Option<String>,
    pending: VecDeque<ListEntry>,
    next_token: Option<String>,
    exhausted: bool,
}
impl Frame {
    fn new(prefix: Option<String>) -> Self {
        Self { prefix, pending: VecDeque::new(), next_token: None, exhausted: false }
    }
}

/// Stream every object below `prefix` (the whole container if `None`).
///
/// A failed listing call yields a [`Listing`](ErrorKind::Listing) failure for
/// that level and abandons it, including any pages not yet fetched; its
/// siblings are still walked. Keys that cannot be mapped onto a local path
/// yield a [`PathMapping`](ErrorKind::PathMapping) failure. The walk stops
/// quietly once `cancel` fires.
pub fn walk<'a>(
    store: &'a dyn ObjectStore,
    prefix: Option<&'a str>,
    cancel: &'a CancellationToken,
) -> impl Stream<Item = Result<RemoteObject, Failure>> + 'a {
    stream! {
        let mut stack = vec![Frame::new(prefix.map(str::to_string))];
        while let Some(frame) = stack.last_mut() {
            if let Some(entry) = frame.pending.pop_front() {
                match entry {
                    ListEntry::Object(object) => yield Ok(object),
                    ListEntry::Prefix(prefix) => stack.push(Frame::new(Some(prefix))),
                    ListEntry::Unmapped(key) => yield Err(Failure {
                        error: exn::Exn::from(ErrorKind::PathMapping(key.clone())),
                        item: key,
                    }),
                }
                continue;
            }
            if frame.exhausted {
                stack.pop();
                continue;
            }
            if cancel.is_cancelled() {
                tracing::warn!("remote walk cancelled");
                return;
            }

            match store.list_page(frame.prefix.as_deref(), frame.next_token.as_deref()).await {
                Ok(page) => {
                    tracing::trace!(prefix = ?frame.prefix, entries = page.entries.len(), "listed page");
                    frame.pending.extend(page.entries);
                    frame.exhausted = page.next_token.is_none();
                    frame.next_token = page.next_token;
                },
                Err(e) => {
                    let item = frame.prefix.clone().unwrap_or_default();
                    tracing::error!(prefix = %item, error = %e, "listing failed; abandoning subtree");
                    stack.pop();
                    yield Err(Failure { error: e.raise(ErrorKind::Listing(item.clone())), item });
                },
            }
        }
    }
}
