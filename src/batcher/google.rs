//! Vertex AI batch prediction adapter.
//!
//! Vertex batch jobs are file-based: per-message payloads are staged as JSONL
//! objects before submission, the job references them by URI, and terminal
//! results land as a predictions file under the job's output prefix. Job
//! states arrive either as enum names or numeric codes depending on the
//! transport, so the mapping accepts both.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::batcher::Batcher;
use crate::error::{ProviderError, Result};
use crate::model::{Model, TextPrompt};
use crate::storage::Storage;
use crate::types::{
    BatchCreate, BatchStatus, BatchUpdate, FailureKind, MessageCreate, MessageInput,
    MessageStatus, MessageUpdate, Usage,
};

/// A Vertex job state, as an enum name or the equivalent numeric code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobState {
    Name(String),
    Code(i64),
}

/// Map a Vertex job state into the canonical batch status.
///
/// Absent and unrecognized states map to `ended`, the conservative terminal
/// default, so the caller does not poll forever.
pub fn map_job_state(state: Option<&JobState>) -> BatchStatus {
    match state {
        None => BatchStatus::Ended,
        Some(JobState::Name(name)) => match name.as_str() {
            "JOB_STATE_PENDING" | "JOB_STATE_QUEUED" | "JOB_STATE_UPDATING" => {
                BatchStatus::InProgress
            }
            "JOB_STATE_CANCELLING" => BatchStatus::Canceling,
            _ => BatchStatus::Ended,
        },
        Some(JobState::Code(code)) => match code {
            1 | 2 | 10 => BatchStatus::InProgress,
            6 => BatchStatus::Canceling,
            _ => BatchStatus::Ended,
        },
    }
}

/// Generation parameters for Gemini models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

/// A Google model configuration.
pub type GoogleModel = Model<GenerationConfig>;

/// Project, location and staging bucket for a Vertex deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleConfig {
    pub project: String,
    pub location: String,
    pub bucket: String,
}

// ============================================================================
// Object store seam
// ============================================================================

/// Bytes of a stored object, yielded as they arrive.
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Durable put/get of named blobs, the slice of GCS this adapter needs.
///
/// `get` hands back a byte stream rather than a buffer so a large predictions
/// file can be decoded line by line as it downloads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, data: Vec<u8>) -> std::result::Result<(), ProviderError>;

    async fn get(&self, name: &str) -> std::result::Result<ObjectStream, ProviderError>;
}

/// In-memory object store for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every stored object, sorted.
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Contents of a stored object, if present.
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(name).cloned()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> std::result::Result<(), ProviderError> {
        self.objects.lock().insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, name: &str) -> std::result::Result<ObjectStream, ProviderError> {
        let data = self
            .objects
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::ObjectStore(format!("no such object: {name}")))?;
        // Yield small chunks so readers see lines split across chunk
        // boundaries, like a real download.
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(16)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// A batch prediction job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPredictionJob {
    pub display_name: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_parameters: Option<serde_json::Value>,
    pub input_config: InputConfig,
    pub output_config: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub instances_format: String,
    pub gcs_source: GcsSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsSource {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    pub predictions_format: String,
    pub gcs_destination: GcsDestination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsDestination {
    pub output_uri_prefix: String,
}

/// Provider view of a created or polled job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<JobState>,
}

/// One staged input line: the caller-assigned id rides along with the request
/// so the predictions file can be correlated back to message rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLine {
    pub custom_id: String,
    pub request: GenerateRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub system_instruction: String,
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One line of the terminal predictions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub custom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<GenerateResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutputError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub content: Content,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<i64>,
    #[serde(default)]
    pub candidates_token_count: Option<i64>,
    #[serde(default)]
    pub cached_content_token_count: Option<i64>,
}

impl UsageMetadata {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_token_count,
            output_tokens: self.candidates_token_count,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: self.cached_content_token_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputError {
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Client seam
// ============================================================================

/// The slice of the Vertex job service a batcher needs.
#[async_trait]
pub trait GoogleClient: Send + Sync {
    async fn create_prediction_job(
        &self,
        job: BatchPredictionJob,
    ) -> std::result::Result<JobInfo, ProviderError>;

    async fn get_prediction_job(
        &self,
        batch_id: &str,
    ) -> std::result::Result<JobInfo, ProviderError>;
}

/// Production client talking to the Vertex REST API.
#[derive(Clone)]
pub struct GoogleHttpClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    project: String,
    location: String,
}

impl GoogleHttpClient {
    pub fn new(access_token: impl Into<String>, config: &GoogleConfig) -> Self {
        let base_url = format!("https://{}-aiplatform.googleapis.com", config.location);
        Self::with_base_url(access_token, config, base_url)
    }

    pub fn with_base_url(
        access_token: impl Into<String>,
        config: &GoogleConfig,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
            project: config.project.clone(),
            location: config.location.clone(),
        }
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
impl GoogleClient for GoogleHttpClient {
    async fn create_prediction_job(
        &self,
        job: BatchPredictionJob,
    ) -> std::result::Result<JobInfo, ProviderError> {
        tracing::debug!(job = %job.display_name, "creating batch prediction job");

        let response = self
            .client
            .post(format!(
                "{}/v1/projects/{}/locations/{}/batchPredictionJobs",
                self.base_url, self.project, self.location
            ))
            .bearer_auth(&self.access_token)
            .json(&job)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json::<JobInfo>().await?)
    }

    async fn get_prediction_job(
        &self,
        batch_id: &str,
    ) -> std::result::Result<JobInfo, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/v1/projects/{}/locations/{}/batchPredictionJobs/{}",
                self.base_url, self.project, self.location, batch_id
            ))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json::<JobInfo>().await?)
    }
}

/// Mock client for tests: configured responses, recorded job requests.
#[derive(Clone, Default)]
pub struct MockGoogleClient {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    create_response: Option<JobInfo>,
    get_responses: Vec<JobInfo>,
    created_jobs: Vec<BatchPredictionJob>,
}

impl MockGoogleClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_create_response(&self, info: JobInfo) {
        self.inner.lock().create_response = Some(info);
    }

    /// Queue a poll response; responses are consumed in FIFO order.
    pub fn push_get_response(&self, info: JobInfo) {
        self.inner.lock().get_responses.push(info);
    }

    pub fn created_jobs(&self) -> Vec<BatchPredictionJob> {
        self.inner.lock().created_jobs.clone()
    }
}

#[async_trait]
impl GoogleClient for MockGoogleClient {
    async fn create_prediction_job(
        &self,
        job: BatchPredictionJob,
    ) -> std::result::Result<JobInfo, ProviderError> {
        let mut state = self.inner.lock();
        state.created_jobs.push(job);
        state.create_response.clone().ok_or(ProviderError::Api {
            status: 500,
            body: "no mock create response configured".to_string(),
        })
    }

    async fn get_prediction_job(
        &self,
        _batch_id: &str,
    ) -> std::result::Result<JobInfo, ProviderError> {
        let mut state = self.inner.lock();
        if state.get_responses.is_empty() {
            return Err(ProviderError::Api {
                status: 500,
                body: "no mock get response configured".to_string(),
            });
        }
        Ok(state.get_responses.remove(0))
    }
}

// ============================================================================
// Batcher
// ============================================================================

/// Batcher against Vertex AI batch prediction jobs.
///
/// Unlike the Anthropic adapter, the batch id is generated locally: it names
/// the staged input objects and the output prefix before the provider ever
/// sees the job.
pub struct GoogleBatcher<S, C, O> {
    client: C,
    storage: S,
    objects: O,
    model: GoogleModel,
    prompt: TextPrompt,
    config: GoogleConfig,
}

impl<S, C, O> GoogleBatcher<S, C, O>
where
    S: Storage,
    C: GoogleClient,
    O: ObjectStore,
{
    pub fn new(
        client: C,
        storage: S,
        objects: O,
        model: GoogleModel,
        prompt: TextPrompt,
        config: GoogleConfig,
    ) -> Self {
        Self {
            client,
            storage,
            objects,
            model,
            prompt,
            config,
        }
    }

    fn input_line(&self, message: &MessageInput) -> InputLine {
        InputLine {
            custom_id: message.id.clone(),
            request: GenerateRequest {
                system_instruction: self.prompt.text.clone(),
                contents: vec![Content {
                    role: "user".to_string(),
                    parts: vec![Part {
                        text: Some(message.content.clone()),
                    }],
                }],
            },
        }
    }

    /// Staged inputs live under the batch id so concurrent batches reusing a
    /// message id cannot clobber each other's objects.
    fn input_object(batch_id: &str, message_id: &str) -> String {
        format!("input/{batch_id}/{message_id}.jsonl")
    }

    fn predictions_object(batch_id: &str) -> String {
        format!("output/{batch_id}/predictions.jsonl")
    }

    async fn reconcile(
        &self,
        line: OutputLine,
        on_value: &mut (impl FnMut(&str, &str) + Send),
        on_error: &mut (impl FnMut(&str, FailureKind) + Send),
    ) -> Result<()> {
        let custom_id = line.custom_id;

        if let Some(error) = line.error {
            let message = error
                .message
                .unwrap_or_else(|| "prediction failed".to_string());
            tracing::warn!(message_id = %custom_id, error = %message, "message errored");
            self.storage
                .update_message(MessageUpdate {
                    id: custom_id.clone(),
                    status: MessageStatus::Errored,
                    output: None,
                    error: Some(message),
                    usage: Usage::default(),
                })
                .await?;
            on_error(&custom_id, FailureKind::Errored);
            return Ok(());
        }

        let Some(response) = line.response else {
            let error = "result contained neither response nor error".to_string();
            tracing::warn!(message_id = %custom_id, "empty prediction record");
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
            return Ok(());
        };

        let usage = response
            .usage_metadata
            .map(UsageMetadata::into_usage)
            .unwrap_or_default();
        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .and_then(|part| part.text);

        match text {
            Some(text) => {
                tracing::info!(message_id = %custom_id, "message succeeded");
                self.storage
                    .update_message(MessageUpdate {
                        id: custom_id.clone(),
                        status: MessageStatus::Succeeded,
                        output: Some(text.clone()),
                        error: None,
                        usage,
                    })
                    .await?;
                on_value(&custom_id, &text);
            }
            None => {
                let error = "expected a text part in the first candidate".to_string();
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

        Ok(())
    }
}

impl<S, C, O> Batcher for GoogleBatcher<S, C, O>
where
    S: Storage,
    C: GoogleClient,
    O: ObjectStore,
{
    async fn create(&self, messages: &[MessageInput]) -> Result<String> {
        let batch_id = Uuid::new_v4().to_string();
        tracing::debug!(
            batch_id = %batch_id,
            messages = messages.len(),
            model = %self.model.name,
            "staging batch inputs"
        );

        let mut uris = Vec::with_capacity(messages.len());
        for message in messages {
            let object_name = Self::input_object(&batch_id, &message.id);
            let line = serde_json::to_vec(&self.input_line(message))
                .map_err(ProviderError::from)?;
            self.objects.put(&object_name, line).await?;
            uris.push(format!("gs://{}/{}", self.config.bucket, object_name));
        }

        let job = BatchPredictionJob {
            display_name: batch_id.clone(),
            model: self.model.name.clone(),
            model_parameters: Some(
                serde_json::to_value(&self.model.params).map_err(ProviderError::from)?,
            ),
            input_config: InputConfig {
                instances_format: "jsonl".to_string(),
                gcs_source: GcsSource { uris },
            },
            output_config: OutputConfig {
                predictions_format: "jsonl".to_string(),
                gcs_destination: GcsDestination {
                    output_uri_prefix: format!(
                        "gs://{}/output/{}",
                        self.config.bucket, batch_id
                    ),
                },
            },
        };

        let info = self.client.create_prediction_job(job).await?;

        self.storage
            .create_batch(BatchCreate {
                id: batch_id.clone(),
                status: map_job_state(info.state.as_ref()),
            })
            .await?;

        for message in messages {
            self.storage
                .create_message(MessageCreate {
                    id: message.id.clone(),
                    batch_id: batch_id.clone(),
                    model_name: self.model.name.clone(),
                    prompt_name: self.prompt.name.clone(),
                    status: MessageStatus::Created,
                    input: message.content.clone(),
                })
                .await?;
        }

        tracing::info!(
            batch_id = %batch_id,
            messages = messages.len(),
            "batch created"
        );

        Ok(batch_id)
    }

    async fn read(
        &self,
        batch_id: &str,
        mut on_value: impl FnMut(&str, &str) + Send,
        mut on_error: impl FnMut(&str, FailureKind) + Send,
    ) -> Result<()> {
        let job = self.client.get_prediction_job(batch_id).await?;
        let status = map_job_state(job.state.as_ref());

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

        // Decode the predictions file line by line as it streams in.
        let stream = self.objects.get(&Self::predictions_object(batch_id)).await?;
        let mut lines = BufReader::new(StreamReader::new(stream)).lines();
        while let Some(line) = lines.next_line().await.map_err(ProviderError::from)? {
            if line.trim().is_empty() {
                continue;
            }
            let record =
                serde_json::from_str::<OutputLine>(&line).map_err(ProviderError::from)?;
            self.reconcile(record, &mut on_value, &mut on_error).await?;
        }

        Ok(())
    }
}
