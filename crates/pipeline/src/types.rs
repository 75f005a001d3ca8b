//! Shared value types for the processor domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! the traffic itself (prompts, responses, embeddings, parameters) and the
//! bounds under which a processor is allowed to inspect it.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Item kinds
// ---------------------------------------------------------------------------

/// The kind of traffic item carried by an envelope or produced by a
/// modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A prompt on its way to a model.
    Prompt,
    /// A model response on its way back to the client.
    Response,
    /// A set of embedding vectors.
    Embedding,
    /// Model invocation parameters.
    Parameters,
}

impl ItemKind {
    /// Returns the lower-case label used in logs, telemetry, and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Prompt => "prompt",
            ItemKind::Response => "response",
            ItemKind::Embedding => "embedding",
            ItemKind::Parameters => "parameters",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Author of a message within a prompt or response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End user of the application.
    #[default]
    User,
    /// System instructions managing the conversation context.
    System,
    /// The model.
    Assistant,
    /// An external tool invoked during the conversation.
    Tool,
    /// Developer-provided instructions.
    Developer,
}

/// A single message with a role and text content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Text content of the message.
    pub content: String,
    /// Author of the message. Defaults to [`MessageRole::User`].
    #[serde(default)]
    pub role: MessageRole,
}

impl Message {
    /// Creates a message with the given role.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }
}

// ---------------------------------------------------------------------------
// Payload bodies
// ---------------------------------------------------------------------------

/// Prompt content: an ordered list of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Messages in conversation order.
    pub messages: Vec<Message>,
}

impl Prompt {
    /// Creates a prompt from a list of messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Creates a prompt holding one user message.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(vec![Message::user(text)])
    }

    /// Concatenates message contents, each followed by a newline.
    ///
    /// When `roles` is non-empty only messages with one of those roles are
    /// included.
    pub fn concatenate(&self, roles: &[MessageRole]) -> String {
        self.messages
            .iter()
            .filter(|m| roles.is_empty() || roles.contains(&m.role))
            .fold(String::new(), |mut acc, m| {
                acc.push_str(&m.content);
                acc.push('\n');
                acc
            })
    }
}

/// One candidate completion returned by a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    /// The message carried by this choice.
    pub message: Message,
}

/// Model response content: a list of choices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Candidate completions in upstream order.
    pub choices: Vec<Choice>,
}

impl Completion {
    /// Creates a completion from a list of choices.
    pub fn new(choices: Vec<Choice>) -> Self {
        Self { choices }
    }

    /// Creates a completion holding one assistant message.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(vec![Choice {
            message: Message::new(MessageRole::Assistant, text),
        }])
    }

    /// Returns the text of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A set of embedding vectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    /// Vectors in upstream order.
    pub vectors: Vec<Vec<f32>>,
}

impl EmbeddingSet {
    /// Creates an embedding set from raw vectors.
    pub fn new(vectors: Vec<Vec<f32>>) -> Self {
        Self { vectors }
    }
}

/// Model invocation parameters as a JSON object.
pub type ParameterMap = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------

/// Typed traffic content. The variant *is* the item kind, so a payload can
/// never disagree with the kind it claims to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum Payload {
    /// Prompt content.
    Prompt(Prompt),
    /// Response content.
    Response(Completion),
    /// Embedding vectors.
    Embedding(EmbeddingSet),
    /// Model parameters.
    Parameters(ParameterMap),
}

impl Payload {
    /// Returns the kind of this payload.
    pub fn kind(&self) -> ItemKind {
        match self {
            Payload::Prompt(_) => ItemKind::Prompt,
            Payload::Response(_) => ItemKind::Response,
            Payload::Embedding(_) => ItemKind::Embedding,
            Payload::Parameters(_) => ItemKind::Parameters,
        }
    }

    /// Returns the prompt body if this is a prompt payload.
    pub fn as_prompt(&self) -> Option<&Prompt> {
        match self {
            Payload::Prompt(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the response body if this is a response payload.
    pub fn as_response(&self) -> Option<&Completion> {
        match self {
            Payload::Response(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Prompt> for Payload {
    fn from(value: Prompt) -> Self {
        Payload::Prompt(value)
    }
}

impl From<Completion> for Payload {
    fn from(value: Completion) -> Self {
        Payload::Response(value)
    }
}

impl From<EmbeddingSet> for Payload {
    fn from(value: EmbeddingSet) -> Self {
        Payload::Embedding(value)
    }
}

// ---------------------------------------------------------------------------
// Execution bounds
// ---------------------------------------------------------------------------

/// Time allowed for processor work on one request.
///
/// `timeout` bounds each processor invocation. `request_timeout`, when set,
/// bounds the whole pipeline run; each step then gets whichever is smaller of
/// `timeout` and the time left in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBudget {
    timeout: Duration,
    request_timeout: Option<Duration>,
}

impl ExecutionBudget {
    /// Creates a per-invocation budget.
    ///
    /// Returns `None` if `timeout` is zero.
    #[must_use]
    pub fn new(timeout: Duration) -> Option<Self> {
        if timeout.is_zero() {
            None
        } else {
            Some(Self {
                timeout,
                request_timeout: None,
            })
        }
    }

    /// Adds an overall bound for the request.
    ///
    /// Returns `None` if `request_timeout` is zero.
    #[must_use]
    pub fn with_request_timeout(self, request_timeout: Duration) -> Option<Self> {
        if request_timeout.is_zero() {
            None
        } else {
            Some(Self {
                request_timeout: Some(request_timeout),
                ..self
            })
        }
    }

    /// Returns the per-invocation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the overall request bound, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Returns the budget for a step starting `elapsed` into the request, or
    /// `None` once the request bound is exhausted.
    pub fn for_step(&self, elapsed: Duration) -> Option<Self> {
        match self.request_timeout {
            None => Some(*self),
            Some(total) => {
                let remaining = total.checked_sub(elapsed).filter(|d| !d.is_zero())?;
                Some(Self {
                    timeout: self.timeout.min(remaining),
                    request_timeout: Some(remaining),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
