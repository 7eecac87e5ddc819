//! In-memory storage implementation.
//!
//! Stores all rows in a shared HashMap behind a read-write lock. Suitable for
//! tests and single-process use; rows are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::PersistenceError;
use crate::types::{
    Batch, BatchCreate, BatchStatus, BatchUpdate, Message, MessageCreate, MessageUpdate, Usage,
};

use super::Storage;

#[derive(Default)]
struct Tables {
    batches: HashMap<String, Batch>,
    messages: HashMap<String, Message>,
}

/// In-memory implementation of the [`Storage`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    async fn create_batch(&self, batch: BatchCreate) -> Result<(), PersistenceError> {
        let mut tables = self.inner.write();
        tables.batches.entry(batch.id.clone()).or_insert(Batch {
            id: batch.id,
            status: batch.status,
        });
        Ok(())
    }

    async fn update_batch(&self, batch: BatchUpdate) -> Result<(), PersistenceError> {
        let mut tables = self.inner.write();
        if let Some(row) = tables.batches.get_mut(&batch.id) {
            row.status = batch.status;
        }
        Ok(())
    }

    async fn random_batches(
        &self,
        limit: usize,
        status: BatchStatus,
    ) -> Result<Vec<String>, PersistenceError> {
        let tables = self.inner.read();

        // HashMap iteration order is arbitrary, which is all the
        // unspecified-order contract asks for.
        Ok(tables
            .batches
            .values()
            .filter(|batch| batch.status == status)
            .take(limit)
            .map(|batch| batch.id.clone())
            .collect())
    }

    async fn create_message(&self, message: MessageCreate) -> Result<(), PersistenceError> {
        let mut tables = self.inner.write();
        tables.messages.entry(message.id.clone()).or_insert(Message {
            id: message.id,
            batch_id: message.batch_id,
            model_name: message.model_name,
            prompt_name: message.prompt_name,
            status: message.status,
            input: message.input,
            output: None,
            error: None,
            usage: Usage::default(),
        });
        Ok(())
    }

    async fn update_message(&self, update: MessageUpdate) -> Result<(), PersistenceError> {
        let mut tables = self.inner.write();
        if let Some(row) = tables.messages.get_mut(&update.id) {
            row.status = update.status;
            if let Some(output) = update.output {
                row.output = Some(output);
            }
            if let Some(error) = update.error {
                row.error = Some(error);
            }
            row.usage.merge(update.usage);
        }
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>, PersistenceError> {
        Ok(self.inner.read().batches.get(id).cloned())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        Ok(self.inner.read().messages.get(id).cloned())
    }
}
