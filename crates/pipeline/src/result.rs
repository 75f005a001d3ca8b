//! The Result model: the single terminal outcome of one processor invocation.
//!
//! [`Outcome`] is a sum type so exactly one of pass, modify, reject, or error
//! is ever active. Tag and metadata deltas travel beside the outcome in
//! [`InvocationResult`]; an error result never carries deltas.

use serde::{Deserialize, Serialize};

use crate::{Metadata, Payload, ProcessorId, Tags};

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Machine-readable category of a rejection, as understood by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectCode {
    #[serde(rename = "AIGW_AUTHENTICATION")]
    Authentication,
    #[serde(rename = "AIGW_AUTHORIZATION")]
    Authorization,
    /// Traffic violates a content policy. The default.
    #[default]
    #[serde(rename = "AIGW_POLICY_VIOLATION")]
    PolicyViolation,
    #[serde(rename = "AIGW_RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "AIGW_RESOURCE_AVAILABILITY")]
    ResourceAvailability,
    #[serde(rename = "AIGW_TIMEOUT")]
    Timeout,
    #[serde(rename = "AIGW_VALIDATION")]
    Validation,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::Authentication => "AIGW_AUTHENTICATION",
            RejectCode::Authorization => "AIGW_AUTHORIZATION",
            RejectCode::PolicyViolation => "AIGW_POLICY_VIOLATION",
            RejectCode::RateLimit => "AIGW_RATE_LIMIT",
            RejectCode::ResourceAvailability => "AIGW_RESOURCE_AVAILABILITY",
            RejectCode::Timeout => "AIGW_TIMEOUT",
            RejectCode::Validation => "AIGW_VALIDATION",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy decision to block traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Why an invocation or composition ended in [`Outcome::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The invocation exceeded its execution budget and was cancelled.
    Timeout,
    /// The processor tried to emit a payload kind it never declared.
    InvalidProduceKind,
    /// The processor returned an error or panicked.
    Unhandled,
    /// Two sources wrote the same metadata key.
    MetadataCollision,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Timeout => "timeout",
            FaultKind::InvalidProduceKind => "invalid_produce_kind",
            FaultKind::Unhandled => "unhandled",
            FaultKind::MetadataCollision => "metadata_collision",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processor malfunction, kept distinct from a policy [`Rejection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFault {
    pub kind: FaultKind,
    /// Human-readable cause. Preserved for telemetry.
    pub detail: String,
}

impl ExecutionFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Exactly one terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// Let the traffic through unchanged.
    Pass,
    /// Replace the traffic with this payload.
    Modify(Payload),
    /// Block the traffic.
    Reject(Rejection),
    /// The processor malfunctioned.
    Error(ExecutionFault),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Pass => OutcomeKind::Pass,
            Outcome::Modify(_) => OutcomeKind::Modify,
            Outcome::Reject(_) => OutcomeKind::Reject,
            Outcome::Error(_) => OutcomeKind::Error,
        }
    }
}

/// The variant of an [`Outcome`] without its data, for logs and provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Pass,
    Modify,
    Reject,
    Error,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Pass => "pass",
            OutcomeKind::Modify => "modify",
            OutcomeKind::Reject => "reject",
            OutcomeKind::Error => "error",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// InvocationResult
// ---------------------------------------------------------------------------

/// The frozen result of one invocation: outcome plus tag and metadata deltas.
///
/// Built only through the constructors below and never mutated afterwards.
/// [`InvocationResult::error`] discards deltas. The constructors do not check
/// a modified payload against any capability; the engine does that while
/// normalising, and [`compose`](crate::compose) refuses payloads the envelope
/// has no slot for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationResult {
    processor: ProcessorId,
    outcome: Outcome,
    tags_added: Tags,
    metadata_added: Metadata,
}

impl InvocationResult {
    pub fn pass(processor: ProcessorId, tags_added: Tags, metadata_added: Metadata) -> Self {
        Self {
            processor,
            outcome: Outcome::Pass,
            tags_added,
            metadata_added,
        }
    }

    pub fn modify(
        processor: ProcessorId,
        payload: Payload,
        tags_added: Tags,
        metadata_added: Metadata,
    ) -> Self {
        Self {
            processor,
            outcome: Outcome::Modify(payload),
            tags_added,
            metadata_added,
        }
    }

    pub fn reject(
        processor: ProcessorId,
        rejection: Rejection,
        tags_added: Tags,
        metadata_added: Metadata,
    ) -> Self {
        Self {
            processor,
            outcome: Outcome::Reject(rejection),
            tags_added,
            metadata_added,
        }
    }

    /// An error result. Any deltas the processor recorded are discarded.
    pub fn error(processor: ProcessorId, fault: ExecutionFault) -> Self {
        Self {
            processor,
            outcome: Outcome::Error(fault),
            tags_added: Tags::new(),
            metadata_added: Metadata::new(),
        }
    }

    /// Pass result for a processor that was not invoked.
    pub fn skipped(processor: ProcessorId) -> Self {
        Self::pass(processor, Tags::new(), Metadata::new())
    }

    pub fn processor(&self) -> &ProcessorId {
        &self.processor
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn tags_added(&self) -> &Tags {
        &self.tags_added
    }

    pub fn metadata_added(&self) -> &Metadata {
        &self.metadata_added
    }

    /// Splits the result into its parts for composition.
    pub fn into_parts(self) -> (ProcessorId, Outcome, Tags, Metadata) {
        (
            self.processor,
            self.outcome,
            self.tags_added,
            self.metadata_added,
        )
    }
}
