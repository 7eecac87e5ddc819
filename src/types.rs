use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical, provider-agnostic status of a batch.
///
/// Every provider-native status vocabulary is mapped into these three values
/// by its adapter. `Ended` is the only terminal state; unrecognized provider
/// statuses map to it so pollers cannot spin forever on a vocabulary drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Canceling,
    Ended,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Canceling => "canceling",
            BatchStatus::Ended => "ended",
        }
    }

    /// Parse the stored string form. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(BatchStatus::InProgress),
            "canceling" => Some(BatchStatus::Canceling),
            "ended" => Some(BatchStatus::Ended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ended)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one message within a batch.
///
/// A message stays `Created` until its owning batch ends. The four other
/// values are terminal, mutually exclusive and final: reconciliation sets one
/// of them exactly once and no further transition occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Created,
    Succeeded,
    Errored,
    Canceled,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Created => "created",
            MessageStatus::Succeeded => "succeeded",
            MessageStatus::Errored => "errored",
            MessageStatus::Canceled => "canceled",
            MessageStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(MessageStatus::Created),
            "succeeded" => Some(MessageStatus::Succeeded),
            "errored" => Some(MessageStatus::Errored),
            "canceled" => Some(MessageStatus::Canceled),
            "expired" => Some(MessageStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Created)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-success terminal outcome reported through the `on_error` callback.
///
/// This is a domain outcome, not a thrown error: it is always recorded on the
/// message row and delivered via callback, never via `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Errored,
    Canceled,
    Expired,
}

impl FailureKind {
    /// The message status this failure persists as.
    pub fn message_status(&self) -> MessageStatus {
        match self {
            FailureKind::Errored => MessageStatus::Errored,
            FailureKind::Canceled => MessageStatus::Canceled,
            FailureKind::Expired => MessageStatus::Expired,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message_status().as_str())
    }
}

/// Token usage counters for one message.
///
/// Each counter is independently settable. Merging keeps previously recorded
/// values when the newer report omits a counter, so a later partial update
/// never erases data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
}

impl Usage {
    /// Overlay `newer` on top of `self`, keeping existing values where the
    /// newer report is absent.
    pub fn merge(&mut self, newer: Usage) {
        if newer.input_tokens.is_some() {
            self.input_tokens = newer.input_tokens;
        }
        if newer.output_tokens.is_some() {
            self.output_tokens = newer.output_tokens;
        }
        if newer.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = newer.cache_creation_input_tokens;
        }
        if newer.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = newer.cache_read_input_tokens;
        }
    }
}

/// A persisted batch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub status: BatchStatus,
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub batch_id: String,
    /// Name of the model configuration this message was submitted with
    pub model_name: String,
    /// Name of the prompt this message was submitted with
    pub prompt_name: String,
    pub status: MessageStatus,
    /// Original request text, immutable once set
    pub input: String,
    /// Result text, set only on success
    pub output: Option<String>,
    /// Error description, set only on non-success terminal states
    pub error: Option<String>,
    #[serde(flatten)]
    pub usage: Usage,
}

/// One request handed to `Batcher::create`: a caller-assigned id that
/// correlates the provider's result rows back to the domain, plus the text to
/// send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInput {
    pub id: String,
    pub content: String,
}

/// Arguments for `Storage::create_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCreate {
    pub id: String,
    pub status: BatchStatus,
}

/// Arguments for `Storage::update_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUpdate {
    pub id: String,
    pub status: BatchStatus,
}

/// Arguments for `Storage::create_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCreate {
    pub id: String,
    pub batch_id: String,
    pub model_name: String,
    pub prompt_name: String,
    pub status: MessageStatus,
    pub input: String,
}

/// Arguments for `Storage::update_message`.
///
/// `status` always overwrites; every other field is merged, so `None` leaves
/// the stored value untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub id: String,
    pub status: MessageStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub usage: Usage,
}

impl MessageUpdate {
    /// Status-only update; all merged fields left untouched.
    pub fn new(id: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: id.into(),
            status,
            output: None,
            error: None,
            usage: Usage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_round_trips_through_strings() {
        for status in [
            BatchStatus::InProgress,
            BatchStatus::Canceling,
            BatchStatus::Ended,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("finished"), None);
    }

    #[test]
    fn message_status_terminality() {
        assert!(!MessageStatus::Created.is_terminal());
        for status in [
            MessageStatus::Succeeded,
            MessageStatus::Errored,
            MessageStatus::Canceled,
            MessageStatus::Expired,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn failure_kind_maps_to_message_status() {
        assert_eq!(
            FailureKind::Errored.message_status(),
            MessageStatus::Errored
        );
        assert_eq!(
            FailureKind::Canceled.message_status(),
            MessageStatus::Canceled
        );
        assert_eq!(
            FailureKind::Expired.message_status(),
            MessageStatus::Expired
        );
    }

    #[test]
    fn usage_merge_keeps_existing_values() {
        let mut usage = Usage {
            input_tokens: Some(5),
            output_tokens: Some(3),
            ..Usage::default()
        };
        usage.merge(Usage {
            output_tokens: Some(7),
            cache_read_input_tokens: Some(2),
            ..Usage::default()
        });

        assert_eq!(usage.input_tokens, Some(5));
        assert_eq!(usage.output_tokens, Some(7));
        assert_eq!(usage.cache_creation_input_tokens, None);
        assert_eq!(usage.cache_read_input_tokens, Some(2));
    }
}
