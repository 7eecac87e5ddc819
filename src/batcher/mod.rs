//! Batch lifecycle orchestration, one implementation per provider.
//!
//! A batcher owns the submit → poll → reconcile state machine for a single
//! provider, model configuration and prompt:
//!
//! ```text
//! created --submit--> in_progress --poll(not terminal)--> in_progress
//!                          |--poll(cancel signal)--> canceling
//!                          |--poll(terminal)--> ended --reconcile--> per-message terminal
//! canceling --poll(terminal)--> ended
//! ```
//!
//! There is no internal scheduler: the caller decides when to invoke `read`
//! again for a batch that has not ended, typically by sampling ids from
//! [`Storage::random_batches`](crate::storage::Storage::random_batches).

use std::future::Future;

use crate::error::Result;
use crate::types::{FailureKind, MessageInput};

pub mod anthropic;
pub mod google;

/// Submit and reconcile batches against one provider.
///
/// Both operations may be invoked more than once for the same batch; the
/// idempotent storage contract makes the duplicate calls safe. Note that
/// under concurrent pollers the callbacks may fire more than once for the
/// same message (at-least-once reconciliation, see `random_batches`).
pub trait Batcher {
    /// Build one provider submission containing all `messages`, send it, then
    /// persist the batch (with its initial canonical status) followed by every
    /// message as `created`.
    ///
    /// Returns the batch id to poll with. If persistence fails partway,
    /// already-inserted rows are safe to retry-create and the whole call
    /// should simply be re-invoked.
    fn create(&self, messages: &[MessageInput]) -> impl Future<Output = Result<String>> + Send;

    /// Poll the provider for `batch_id` and persist the mapped status.
    ///
    /// Returns without further work while the batch has not ended — this is
    /// the suspension point for polling-based waiting. Once ended, lazily
    /// iterates the provider's result stream and records each message's final
    /// outcome, invoking `on_value(id, text)` on success and
    /// `on_error(id, kind)` otherwise. Message outcomes are independent: one
    /// failure never aborts reconciliation of its siblings.
    fn read(
        &self,
        batch_id: &str,
        on_value: impl FnMut(&str, &str) + Send,
        on_error: impl FnMut(&str, FailureKind) + Send,
    ) -> impl Future<Output = Result<()>> + Send;
}
