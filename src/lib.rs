//! Lifecycle tracking for asynchronous LLM batch jobs.
//!
//! A batch groups many independent text requests, is processed out-of-band by
//! the provider, and must be polled until it reaches a terminal state, at
//! which point each request's individual result is durably recorded exactly
//! once. This crate provides:
//!
//! - The [`Batcher`] contract (submit → poll → reconcile-per-message) with
//!   adapters for the Anthropic Message Batches API and Vertex AI batch
//!   prediction
//! - The idempotent [`Storage`] contract it depends on, with in-memory and
//!   SQLite backends
//!
//! There is no internal scheduler, retry, or rate limiting: the caller decides
//! when to call, and the idempotent persistence layer makes repeated calls
//! safe.
//!
//! # Example
//! ```ignore
//! use volley::{
//!     AnthropicBatcher, AnthropicHttpClient, AnthropicParams, Batcher, Model, SqliteStorage,
//!     TextPrompt,
//! };
//!
//! let pool = sqlx::SqlitePool::connect("sqlite://volley.db").await?;
//! let storage = SqliteStorage::new(pool);
//! storage.migrate().await?;
//!
//! let batcher = AnthropicBatcher::new(
//!     AnthropicHttpClient::new(api_key),
//!     storage,
//!     Model::new("haiku", AnthropicParams::new("claude-3-5-haiku-latest", 1024)),
//!     TextPrompt::new("helper", "You are a helpful assistant."),
//! );
//!
//! let batch_id = batcher.create(&messages).await?;
//! // ... later, from a poller loop:
//! batcher.read(&batch_id, on_value, on_error).await?;
//! ```

pub mod batcher;
pub mod error;
pub mod model;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use batcher::anthropic::{
    AnthropicBatcher, AnthropicClient, AnthropicHttpClient, AnthropicModel, AnthropicParams,
    MockAnthropicClient, ThinkingConfig,
};
pub use batcher::google::{
    GenerationConfig, GoogleBatcher, GoogleClient, GoogleConfig, GoogleHttpClient, GoogleModel,
    InMemoryObjectStore, MockGoogleClient, ObjectStore, ObjectStream,
};
pub use batcher::Batcher;
pub use error::{Error, PersistenceError, ProviderError, Result};
pub use model::{Model, TextPrompt};
pub use storage::in_memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use storage::sqlite::SqliteStorage;
pub use storage::Storage;
pub use types::{
    Batch, BatchCreate, BatchStatus, BatchUpdate, FailureKind, Message, MessageCreate,
    MessageInput, MessageStatus, MessageUpdate, Usage,
};
