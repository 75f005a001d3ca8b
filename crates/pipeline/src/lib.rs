//! Core domain for AI-gateway processors.
//!
//! This crate contains every domain concept used to inspect and transform
//! gateway traffic: newtype identifiers, payload value types, the Input
//! Envelope, Capability Declarations, the Result model, the processor port,
//! and Result Composition. Infrastructure crates implement or drive the traits
//! defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* a processor is and how its results combine; the `engine`
//! crate defines *how* invocations are run and bounded.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`ProcessorId`, `InvocationId`, etc.) |
//! | [`types`] | Payload value types, `ItemKind`, `ExecutionBudget`, `Timestamp` |
//! | [`tags`] | Union-only tag sets |
//! | [`metadata`] | Write-once metadata with strict merge |
//! | [`envelope`] | `InputEnvelope` |
//! | [`capability`] | `CapabilityDeclaration` and the cross-kind whitelist |
//! | [`result`] | `Outcome`, `InvocationResult`, reject codes, fault kinds |
//! | [`parameters`] | `ParameterSchema` for per-request processor settings |
//! | [`processor`] | `Processor` trait, descriptor, permissions, invocation context |
//! | [`composition`] | `PipelineState`, `compose`, provenance |
//! | [`errors`] | `PipelineError` |

pub mod capability;
pub mod composition;
pub mod envelope;
pub mod errors;
pub mod identifiers;
pub mod metadata;
pub mod parameters;
pub mod processor;
pub mod result;
pub mod tags;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use capability::{CapabilityDeclaration, SignatureField, WELL_KNOWN_TRANSFORMS};
pub use composition::{compose, PipelineResult, PipelineState, ProvenanceRecord};
pub use envelope::InputEnvelope;
pub use errors::PipelineError;
pub use identifiers::{
    InvocationId, ProcessorId, ProcessorName, ProcessorNamespace, ProcessorVersion, RequestId,
    StepId,
};
pub use metadata::Metadata;
pub use parameters::{ParameterField, ParameterSchema, ParameterType};
pub use processor::{
    InvocationContext, Permissions, Processor, ProcessorDescriptor, ProcessorFault,
};
pub use result::{
    ExecutionFault, FaultKind, InvocationResult, Outcome, OutcomeKind, RejectCode, Rejection,
};
pub use tags::Tags;
pub use types::{
    Choice, Completion, EmbeddingSet, ExecutionBudget, ItemKind, Message, MessageRole,
    ParameterMap, Payload, Prompt, Timestamp,
};
