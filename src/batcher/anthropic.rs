//! Anthropic Message Batches adapter.
//!
//! Translates canonical requests into the `/v1/messages/batches` wire shape,
//! maps the provider's processing status into the canonical batch status, and
//! reconciles the terminal JSONL result stream one record at a time without
//! buffering the whole batch.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::batcher::Batcher;
use crate::error::{ProviderError, Result};
use crate::model::{Model, TextPrompt};
use crate::storage::Storage;
use crate::types::{
    BatchCreate, BatchStatus, BatchUpdate, FailureKind, MessageCreate, MessageInput,
    MessageStatus, MessageUpdate, Usage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Generation parameters for the Anthropic Messages API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicParams {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl AnthropicParams {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            thinking: None,
        }
    }
}

/// Extended thinking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
    Disabled,
}

/// An Anthropic model configuration.
pub type AnthropicModel = Model<AnthropicParams>;

impl AnthropicModel {
    /// Position of the answer block in a result's content array.
    ///
    /// Extended thinking prepends a thinking block to every response, shifting
    /// the text one slot later. Fixed at construction time, not recomputed per
    /// message.
    pub fn content_index(&self) -> usize {
        match self.params.thinking {
            Some(ThinkingConfig::Enabled { .. }) => 1,
            _ => 0,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// One entry in a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequestItem {
    pub custom_id: String,
    pub params: MessageParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageParams {
    #[serde(flatten)]
    pub model: AnthropicParams,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Provider view of a batch job.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageBatch {
    pub id: String,
    pub processing_status: String,
}

impl MessageBatch {
    /// Map the provider's status vocabulary into the canonical model.
    ///
    /// Unrecognized values are treated as terminal so a vocabulary drift can
    /// never leave callers polling forever.
    pub fn canonical_status(&self) -> BatchStatus {
        match self.processing_status.as_str() {
            "in_progress" => BatchStatus::InProgress,
            "canceling" => BatchStatus::Canceling,
            _ => BatchStatus::Ended,
        }
    }
}

/// One record of the terminal result stream.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResultItem {
    pub custom_id: String,
    pub result: BatchResult,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchResult {
    Succeeded { message: ResultMessage },
    Errored { error: ErrorEnvelope },
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Usage,
}

/// A content block as returned by the API. Only the `text` kind carries an
/// answer this crate extracts; other kinds are recorded as per-message errors.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
}

// ============================================================================
// Client seam
// ============================================================================

/// Lazily yielded per-message results of a terminal batch.
pub type ResultStream = BoxStream<'static, std::result::Result<BatchResultItem, ProviderError>>;

/// The slice of the Anthropic API a batcher needs.
///
/// Abstracting the HTTP calls keeps the reconciliation logic testable without
/// a network; see [`MockAnthropicClient`].
#[async_trait]
pub trait AnthropicClient: Send + Sync {
    /// Submit a batch of requests, returning the provider-assigned id and
    /// initial processing status.
    async fn create_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> std::result::Result<MessageBatch, ProviderError>;

    /// Fetch the current processing status of a batch.
    async fn retrieve_batch(
        &self,
        batch_id: &str,
    ) -> std::result::Result<MessageBatch, ProviderError>;

    /// Stream the per-message results of a terminal batch.
    ///
    /// The stream is decoded lazily from the response body; dropping it
    /// abandons the transfer. It restarts from the beginning on every call
    /// (not resumable mid-stream).
    async fn results(&self, batch_id: &str) -> std::result::Result<ResultStream, ProviderError>;
}

/// Production client talking to the Anthropic HTTP API.
#[derive(Clone)]
pub struct AnthropicHttpClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicHttpClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Point the client at a different host (self-hosted gateways, tests).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn check(
        response: reqwest::Response,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AnthropicClient for AnthropicHttpClient {
    async fn create_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> std::result::Result<MessageBatch, ProviderError> {
        tracing::debug!(requests = requests.len(), "submitting message batch");

        let response = self
            .request(reqwest::Method::POST, "/v1/messages/batches")
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json::<MessageBatch>().await?)
    }

    async fn retrieve_batch(
        &self,
        batch_id: &str,
    ) -> std::result::Result<MessageBatch, ProviderError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/messages/batches/{batch_id}"),
            )
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json::<MessageBatch>().await?)
    }

    async fn results(&self, batch_id: &str) -> std::result::Result<ResultStream, ProviderError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/messages/batches/{batch_id}/results"),
            )
            .send()
            .await?;
        let response = Self::check(response).await?;

        // The results endpoint answers with JSONL; decode line by line as the
        // body arrives instead of buffering the whole batch.
        let reader = StreamReader::new(response.bytes_stream().map_err(std::io::Error::other));
        let lines = LinesStream::new(BufReader::new(reader).lines());

        let stream = lines.filter_map(|line| {
            future::ready(match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    serde_json::from_str::<BatchResultItem>(&line).map_err(ProviderError::from),
                ),
                Err(e) => Some(Err(ProviderError::Io(e))),
            })
        });

        Ok(stream.boxed())
    }
}

/// Mock client for tests: configured responses, recorded submissions.
#[derive(Clone, Default)]
pub struct MockAnthropicClient {
    inner: std::sync::Arc<parking_lot::Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    create_response: Option<MessageBatch>,
    retrieve_responses: Vec<MessageBatch>,
    results: Vec<BatchResultItem>,
    created_requests: Vec<Vec<BatchRequestItem>>,
}

impl MockAnthropicClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_response(&self, batch: MessageBatch) {
        self.inner.lock().create_response = Some(batch);
    }

    /// Queue a retrieve response; responses are consumed in FIFO order.
    pub fn push_retrieve_response(&self, batch: MessageBatch) {
        self.inner.lock().retrieve_responses.push(batch);
    }

    pub fn set_results(&self, items: Vec<BatchResultItem>) {
        self.inner.lock().results = items;
    }

    /// Every request list passed to `create_batch`, in call order.
    pub fn created_requests(&self) -> Vec<Vec<BatchRequestItem>> {
        self.inner.lock().created_requests.clone()
    }
}

#[async_trait]
impl AnthropicClient for MockAnthropicClient {
    async fn create_batch(
        &self,
        requests: Vec<BatchRequestItem>,
    ) -> std::result::Result<MessageBatch, ProviderError> {
        let mut state = self.inner.lock();
        state.created_requests.push(requests);
        state.create_response.clone().ok_or(ProviderError::Api {
            status: 500,
            body: "no mock create response configured".to_string(),
        })
    }

    async fn retrieve_batch(
        &self,
        _batch_id: &str,
    ) -> std::result::Result<MessageBatch, ProviderError> {
        let mut state = self.inner.lock();
        if state.retrieve_responses.is_empty() {
            return Err(ProviderError::Api {
                status: 500,
                body: "no mock retrieve response configured".to_string(),
            });
        }
        Ok(state.retrieve_responses.remove(0))
    }

    async fn results(&self, _batch_id: &str) -> std::result::Result<ResultStream, ProviderError> {
        let items = self.inner.lock().results.clone();
        Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
    }
}

// ============================================================================
// Batcher
// ============================================================================

/// Batcher against the Anthropic Message Batches API.
pub struct AnthropicBatcher<S, C> {
    client: C,
    storage: S,
    model: AnthropicModel,
    prompt: TextPrompt,
    content_index: usize,
}

impl<S, C> AnthropicBatcher<S, C>
where
    S: Storage,
    C: AnthropicClient,
{
    pub fn new(client: C, storage: S, model: AnthropicModel, prompt: TextPrompt) -> Self {
        let content_index = model.content_index();
        Self {
            client,
            storage,
            model,
            prompt,
            content_index,
        }
    }

    fn build_requests(&self, messages: &[MessageInput]) -> Vec<BatchRequestItem> {
        messages
            .iter()
            .map(|message| BatchRequestItem {
                custom_id: message.id.clone(),
                params: MessageParams {
                    model: self.model.params.clone(),
                    system: vec![SystemBlock {
                        kind: "text".to_string(),
                        text: self.prompt.text.clone(),
                        cache_control: self.prompt.cache.then(|| CacheControl {
                            kind: "ephemeral".to_string(),
                        }),
                    }],
                    messages: vec![ChatMessage {
                        role: "user".to_string(),
                        content: message.content.clone(),
                    }],
                },
            })
            .collect()
    }

    async fn reconcile(
        &self,
        item: BatchResultItem,
        on_value: &mut (impl FnMut(&str, &str) + Send),
        on_error: &mut (impl FnMut(&str, FailureKind) + Send),
    ) -> Result<()> {
        let custom_id = item.custom_id;

        match item.result {
            BatchResult::Succeeded { message } => {
                let block = message.content.into_iter().nth(self.content_index);
                match block {
                    Some(ContentBlock {
                        kind,
                        text: Some(text),
                    }) if kind == "text" => {
                        tracing::info!(message_id = %custom_id, "message succeeded");
                        self.storage
                            .update_message(MessageUpdate {
                                id: custom_id.clone(),
                                status: MessageStatus::Succeeded,
                                output: Some(text.clone()),
                                error: None,
                                usage: message.usage,
                            })
                            .await?;
                        on_value(&custom_id, &text);
                    }
                    other => {
                        // Provider-reported success, but nothing we can hand
                        // to the caller: a local per-message failure.
                        let kind = other
                            .map(|block| block.kind)
                            .unwrap_or_else(|| "missing".to_string());
                        let error = format!("expected a \"text\" content block, got \"{kind}\"");
                        tracing::warn!(message_id = %custom_id, error = %error, "message is not text");
                        self.storage
                            .update_message(MessageUpdate {
                                id: custom_id.clone(),
                                status: MessageStatus::Errored,
                                output: None,
                                error: Some(error),
                                usage: Usage::default(),
                            })
                            .await?;
                        on_error(&custom_id, FailureKind::Errored);
                    }
                }
            }
            BatchResult::Errored { error } => {
                tracing::warn!(message_id = %custom_id, error = %error.error.message, "message errored");
                self.storage
                    .update_message(MessageUpdate {
                        id: custom_id.clone(),
                        status: MessageStatus::Errored,
                        output: None,
                        error: Some(error.error.message),
                        usage: Usage::default(),
                    })
                    .await?;
                on_error(&custom_id, FailureKind::Errored);
            }
            BatchResult::Canceled => {
                tracing::warn!(message_id = %custom_id, "message canceled");
                self.storage
                    .update_message(MessageUpdate::new(custom_id.clone(), MessageStatus::Canceled))
                    .await?;
                on_error(&custom_id, FailureKind::Canceled);
            }
            BatchResult::Expired => {
                tracing::warn!(message_id = %custom_id, "message expired");
                self.storage
                    .update_message(MessageUpdate::new(custom_id.clone(), MessageStatus::Expired))
                    .await?;
                on_error(&custom_id, FailureKind::Expired);
            }
        }

        Ok(())
    }
}

impl<S, C> Batcher for AnthropicBatcher<S, C>
where
    S: Storage,
    C: AnthropicClient,
{
    async fn create(&self, messages: &[MessageInput]) -> Result<String> {
        let requests = self.build_requests(messages);
        tracing::debug!(
            messages = messages.len(),
            model = %self.model.name,
            "creating message batch"
        );

        let batch = self.client.create_batch(requests).await?;

        // Batch row first: messages reference it.
        self.storage
            .create_batch(BatchCreate {
                id: batch.id.clone(),
                status: batch.canonical_status(),
            })
            .await?;

        for message in messages {
            self.storage
                .create_message(MessageCreate {
                    id: message.id.clone(),
                    batch_id: batch.id.clone(),
                    model_name: self.model.name.clone(),
                    prompt_name: self.prompt.name.clone(),
                    status: MessageStatus::Created,
                    input: message.content.clone(),
                })
                .await?;
        }

        tracing::info!(
            batch_id = %batch.id,
            messages = messages.len(),
            "batch created"
        );

        Ok(batch.id)
    }

    async fn read(
        &self,
        batch_id: &str,
        mut on_value: impl FnMut(&str, &str) + Send,
        mut on_error: impl FnMut(&str, FailureKind) + Send,
    ) -> Result<()> {
        let batch = self.client.retrieve_batch(batch_id).await?;
        let status = batch.canonical_status();

        self.storage
            .update_batch(BatchUpdate {
                id: batch_id.to_string(),
                status,
            })
            .await?;

        if status != BatchStatus::Ended {
            tracing::debug!(batch_id = %batch_id, status = %status, "batch has not ended yet");
            return Ok(());
        }

        let mut results = self.client.results(batch_id).await?;
        while let Some(item) = results.next().await {
            self.reconcile(item?, &mut on_value, &mut on_error).await?;
        }

        Ok(())
    }
}
