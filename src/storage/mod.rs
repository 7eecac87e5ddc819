use std::future::Future;

use crate::error::PersistenceError;
use crate::types::{
    Batch, BatchCreate, BatchStatus, BatchUpdate, Message, MessageCreate, MessageUpdate,
};

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod tests;

/// Storage trait for persisting batch and message lifecycle state.
///
/// Every operation is idempotent: creates are insert-if-absent, updates are
/// update-if-present with merge semantics on optional fields. `create` and
/// `read` on a batcher may be invoked more than once for the same batch
/// (at-least-once caller semantics), and multiple pollers may reconcile the
/// same batch concurrently, so implementations must tolerate duplicate calls
/// without duplicating rows or losing recorded data.
pub trait Storage: Send + Sync {
    /// Insert a batch row if none with that id exists yet.
    ///
    /// Calling twice with the same id is a no-op after the first; the stored
    /// status is never overwritten by a second create.
    fn create_batch(
        &self,
        batch: BatchCreate,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Overwrite the status of an existing batch row.
    ///
    /// A no-op when the batch does not exist; never creates a row.
    fn update_batch(
        &self,
        batch: BatchUpdate,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Return up to `limit` ids of batches currently in `status`, in an
    /// unspecified (randomized) order.
    ///
    /// This lets independent pollers each pick a subset of the outstanding
    /// work without coordination. There is no locking or leasing: two
    /// concurrent callers may receive overlapping ids, and safety under that
    /// overlap rests on the idempotence of the update operations.
    fn random_batches(
        &self,
        limit: usize,
        status: BatchStatus,
    ) -> impl Future<Output = Result<Vec<String>, PersistenceError>> + Send;

    /// Insert a message row if none with that id exists yet.
    ///
    /// Same idempotence rule as [`Storage::create_batch`]. The owning batch
    /// row must already exist.
    fn create_message(
        &self,
        message: MessageCreate,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Update an existing message row.
    ///
    /// `status` is always overwritten. Every optional field is merged: an
    /// absent value leaves the previously stored value unchanged, so a partial
    /// usage report never nulls out recorded counters. A no-op when the
    /// message does not exist.
    fn update_message(
        &self,
        update: MessageUpdate,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Look up a batch row (read-only, for monitoring and tests).
    fn get_batch(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Batch>, PersistenceError>> + Send;

    /// Look up a message row (read-only, for monitoring and tests).
    fn get_message(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Message>, PersistenceError>> + Send;
}
