//! The Input Envelope: one immutable unit of traffic handed to a processor.
//!
//! An envelope is built once per inbound request by the routing layer and is
//! read-only to processors. A modification never mutates the envelope in
//! place; [`InputEnvelope::derive`] produces a new envelope that carries the
//! replacement payload and the same accumulated metadata and tags.
//!
//! ## Slots
//!
//! | Slot | Holds | Replaced by |
//! |------|-------|-------------|
//! | payload | the item being processed; fixes the item kind | modify of the same kind |
//! | model parameters | parameters derived from the payload | modify producing `Parameters` from a prompt or response |

use serde::{Deserialize, Serialize};

use crate::{ItemKind, Metadata, ParameterMap, Payload, Prompt, Tags, WELL_KNOWN_TRANSFORMS};

/// Validated traffic plus request-scoped metadata and prior tags.
///
/// The item kind is not stored separately; it is always the kind of the
/// payload, so the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEnvelope {
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_parameters: Option<ParameterMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt_context: Option<Prompt>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    tags: Tags,
}

impl InputEnvelope {
    /// Creates an envelope with no metadata or tags.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            model_parameters: None,
            prompt_context: None,
            metadata: Metadata::new(),
            tags: Tags::new(),
        }
    }

    /// Attaches request-scoped metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attaches tags accumulated by earlier processors.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Attaches the originating prompt as read-only context for a
    /// response-stage envelope.
    #[must_use]
    pub fn with_prompt_context(mut self, prompt: Prompt) -> Self {
        self.prompt_context = Some(prompt);
        self
    }

    /// Attaches model parameters alongside a prompt or response payload.
    #[must_use]
    pub fn with_model_parameters(mut self, parameters: ParameterMap) -> Self {
        self.model_parameters = Some(parameters);
        self
    }

    pub fn item_kind(&self) -> ItemKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The prompt that produced this response, when the gateway supplied it.
    pub fn prompt_context(&self) -> Option<&Prompt> {
        self.prompt_context.as_ref()
    }

    /// Model parameters set by the gateway or by an earlier modification.
    pub fn model_parameters(&self) -> Option<&ParameterMap> {
        self.model_parameters.as_ref()
    }

    /// `true` when a modification producing `kind` has a slot here: the
    /// payload's own kind, or a well-known transform target of it.
    pub fn accepts(&self, kind: ItemKind) -> bool {
        let own = self.item_kind();
        kind == own || WELL_KNOWN_TRANSFORMS.contains(&(own, kind))
    }

    /// `true` when `payload` equals what the envelope already holds in the
    /// slot `payload` would replace.
    pub fn holds(&self, payload: &Payload) -> bool {
        match payload {
            _ if payload.kind() == self.item_kind() => payload == &self.payload,
            Payload::Parameters(map) => self.model_parameters.as_ref() == Some(map),
            _ => false,
        }
    }

    /// The current content of the slot for `kind`, if any.
    pub fn slot(&self, kind: ItemKind) -> Option<Payload> {
        if kind == self.item_kind() {
            Some(self.payload.clone())
        } else if kind == ItemKind::Parameters {
            self.model_parameters.clone().map(Payload::Parameters)
        } else {
            None
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Returns a new envelope with `payload` in its slot.
    ///
    /// Parameters produced from a prompt or response fill the model
    /// parameters slot and leave the payload alone; anything else replaces
    /// the payload. Callers check [`accepts`](Self::accepts) first. Every
    /// other slot, metadata, tags, and prompt context are carried over.
    #[must_use]
    pub fn derive(&self, payload: Payload) -> Self {
        let mut next = self.clone();
        match payload {
            Payload::Parameters(map) if self.item_kind() != ItemKind::Parameters => {
                next.model_parameters = Some(map);
            }
            payload => next.payload = payload,
        }
        next
    }

    /// Returns a copy with `metadata` and `tags` merged in.
    ///
    /// Metadata is merged strictly; on collision the envelope is left
    /// untouched and the error is returned.
    pub(crate) fn with_deltas(
        &self,
        tags: &Tags,
        metadata: &Metadata,
    ) -> Result<Self, crate::PipelineError> {
        let mut next = self.clone();
        next.metadata.merge_strict(metadata)?;
        next.tags.merge(tags);
        Ok(next)
    }
}
