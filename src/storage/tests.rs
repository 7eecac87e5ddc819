use rstest::{fixture, rstest};

use crate::storage::{in_memory::InMemoryStorage, Storage};
use crate::types::{
    BatchCreate, BatchStatus, BatchUpdate, MessageCreate, MessageStatus, MessageUpdate, Usage,
};

#[cfg(feature = "sqlite")]
use crate::storage::sqlite::SqliteStorage;

fn batch(id: &str, status: BatchStatus) -> BatchCreate {
    BatchCreate {
        id: id.to_string(),
        status,
    }
}

fn message(id: &str, batch_id: &str, input: &str) -> MessageCreate {
    MessageCreate {
        id: id.to_string(),
        batch_id: batch_id.to_string(),
        model_name: "test-model".to_string(),
        prompt_name: "test-prompt".to_string(),
        status: MessageStatus::Created,
        input: input.to_string(),
    }
}

#[fixture]
fn in_memory_storage() -> InMemoryStorage {
    InMemoryStorage::new()
}

/// A single-connection in-memory database, so every query sees the same data.
#[cfg(feature = "sqlite")]
async fn sqlite_storage() -> SqliteStorage {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    let storage = SqliteStorage::new(pool);
    storage.migrate().await.expect("migration failed");
    storage
}

async fn run_test_create_batch_is_idempotent<S: Storage>(storage: &S) {
    storage
        .create_batch(batch("b1", BatchStatus::InProgress))
        .await
        .unwrap();

    // Second create with a different status must not overwrite the row.
    storage
        .create_batch(batch("b1", BatchStatus::Ended))
        .await
        .unwrap();

    let row = storage.get_batch("b1").await.unwrap().unwrap();
    assert_eq!(row.status, BatchStatus::InProgress);
}

#[rstest]
#[tokio::test]
async fn test_create_batch_is_idempotent(in_memory_storage: InMemoryStorage) {
    run_test_create_batch_is_idempotent(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_create_batch_is_idempotent_sqlite() {
    run_test_create_batch_is_idempotent(&sqlite_storage().await).await;
}

async fn run_test_update_batch_changes_status<S: Storage>(storage: &S) {
    storage
        .create_batch(batch("b1", BatchStatus::InProgress))
        .await
        .unwrap();
    storage
        .update_batch(BatchUpdate {
            id: "b1".to_string(),
            status: BatchStatus::Ended,
        })
        .await
        .unwrap();

    let row = storage.get_batch("b1").await.unwrap().unwrap();
    assert_eq!(row.status, BatchStatus::Ended);
}

#[rstest]
#[tokio::test]
async fn test_update_batch_changes_status(in_memory_storage: InMemoryStorage) {
    run_test_update_batch_changes_status(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_update_batch_changes_status_sqlite() {
    run_test_update_batch_changes_status(&sqlite_storage().await).await;
}

async fn run_test_update_missing_batch_is_noop<S: Storage>(storage: &S) {
    storage
        .update_batch(BatchUpdate {
            id: "ghost".to_string(),
            status: BatchStatus::Ended,
        })
        .await
        .unwrap();

    // Update never creates.
    assert!(storage.get_batch("ghost").await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn test_update_missing_batch_is_noop(in_memory_storage: InMemoryStorage) {
    run_test_update_missing_batch_is_noop(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_update_missing_batch_is_noop_sqlite() {
    run_test_update_missing_batch_is_noop(&sqlite_storage().await).await;
}

async fn run_test_random_batches_filters_and_limits<S: Storage>(storage: &S) {
    for i in 0..5 {
        storage
            .create_batch(batch(&format!("active-{i}"), BatchStatus::InProgress))
            .await
            .unwrap();
    }
    storage
        .create_batch(batch("done", BatchStatus::Ended))
        .await
        .unwrap();

    let ids = storage
        .random_batches(3, BatchStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    for id in &ids {
        assert!(id.starts_with("active-"));
    }

    let all = storage
        .random_batches(100, BatchStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(all.len(), 5);

    let canceling = storage
        .random_batches(100, BatchStatus::Canceling)
        .await
        .unwrap();
    assert!(canceling.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_random_batches_filters_and_limits(in_memory_storage: InMemoryStorage) {
    run_test_random_batches_filters_and_limits(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_random_batches_filters_and_limits_sqlite() {
    run_test_random_batches_filters_and_limits(&sqlite_storage().await).await;
}

async fn run_test_create_message_is_idempotent<S: Storage>(storage: &S) {
    storage
        .create_batch(batch("b1", BatchStatus::InProgress))
        .await
        .unwrap();
    storage.create_message(message("m1", "b1", "hi")).await.unwrap();
    storage
        .create_message(message("m1", "b1", "something else"))
        .await
        .unwrap();

    let row = storage.get_message("m1").await.unwrap().unwrap();
    assert_eq!(row.input, "hi");
    assert_eq!(row.status, MessageStatus::Created);
    assert_eq!(row.batch_id, "b1");
    assert_eq!(row.model_name, "test-model");
    assert_eq!(row.prompt_name, "test-prompt");
}

#[rstest]
#[tokio::test]
async fn test_create_message_is_idempotent(in_memory_storage: InMemoryStorage) {
    run_test_create_message_is_idempotent(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_create_message_is_idempotent_sqlite() {
    run_test_create_message_is_idempotent(&sqlite_storage().await).await;
}

async fn run_test_update_message_merges_optional_fields<S: Storage>(storage: &S) {
    storage
        .create_batch(batch("b1", BatchStatus::Ended))
        .await
        .unwrap();
    storage.create_message(message("m1", "b1", "hi")).await.unwrap();

    storage
        .update_message(MessageUpdate {
            id: "m1".to_string(),
            status: MessageStatus::Succeeded,
            output: Some("hello".to_string()),
            error: None,
            usage: Usage {
                input_tokens: Some(5),
                ..Usage::default()
            },
        })
        .await
        .unwrap();

    // A later partial update must not erase previously recorded values.
    storage
        .update_message(MessageUpdate {
            id: "m1".to_string(),
            status: MessageStatus::Succeeded,
            output: None,
            error: None,
            usage: Usage {
                output_tokens: Some(3),
                ..Usage::default()
            },
        })
        .await
        .unwrap();

    let row = storage.get_message("m1").await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Succeeded);
    assert_eq!(row.output.as_deref(), Some("hello"));
    assert_eq!(row.error, None);
    assert_eq!(row.usage.input_tokens, Some(5));
    assert_eq!(row.usage.output_tokens, Some(3));
    assert_eq!(row.usage.cache_creation_input_tokens, None);
    assert_eq!(row.usage.cache_read_input_tokens, None);
}

#[rstest]
#[tokio::test]
async fn test_update_message_merges_optional_fields(in_memory_storage: InMemoryStorage) {
    run_test_update_message_merges_optional_fields(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_update_message_merges_optional_fields_sqlite() {
    run_test_update_message_merges_optional_fields(&sqlite_storage().await).await;
}

async fn run_test_update_missing_message_is_noop<S: Storage>(storage: &S) {
    storage
        .update_message(MessageUpdate::new("ghost", MessageStatus::Errored))
        .await
        .unwrap();

    assert!(storage.get_message("ghost").await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn test_update_missing_message_is_noop(in_memory_storage: InMemoryStorage) {
    run_test_update_missing_message_is_noop(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_update_missing_message_is_noop_sqlite() {
    run_test_update_missing_message_is_noop(&sqlite_storage().await).await;
}

async fn run_test_reconciling_twice_is_stable<S: Storage>(storage: &S) {
    storage
        .create_batch(batch("b1", BatchStatus::Ended))
        .await
        .unwrap();
    storage.create_message(message("m1", "b1", "hi")).await.unwrap();

    let update = MessageUpdate {
        id: "m1".to_string(),
        status: MessageStatus::Succeeded,
        output: Some("hello".to_string()),
        error: None,
        usage: Usage {
            input_tokens: Some(5),
            output_tokens: Some(3),
            ..Usage::default()
        },
    };

    // A second poller reconciling the same terminal result must leave the row
    // exactly as the first left it.
    storage.update_message(update.clone()).await.unwrap();
    let first = storage.get_message("m1").await.unwrap().unwrap();

    storage.update_message(update).await.unwrap();
    let second = storage.get_message("m1").await.unwrap().unwrap();

    assert_eq!(first, second);
}

#[rstest]
#[tokio::test]
async fn test_reconciling_twice_is_stable(in_memory_storage: InMemoryStorage) {
    run_test_reconciling_twice_is_stable(&in_memory_storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_reconciling_twice_is_stable_sqlite() {
    run_test_reconciling_twice_is_stable(&sqlite_storage().await).await;
}
