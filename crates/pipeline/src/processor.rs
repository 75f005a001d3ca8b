//! The processor port: what a plugin author implements.
//!
//! ## Architectural Layer
//!
//! **Port definition.** The [`Processor`] trait is consumed by the execution
//! engine; implementations live in plugin crates. The [`InvocationContext`]
//! is the write-once accumulator handed to each invocation and frozen into an
//! [`InvocationResult`] when the invocation ends.
//!
//! ## Normalisation order
//!
//! [`InvocationContext::finish`] turns whatever the processor did into one
//! result, checking in this order:
//!
//! 1. returned fault → `Error(Unhandled)`
//! 2. more than one outcome call → `Error(Unhandled)`
//! 3. modify with an undeclared kind, or one the envelope has no slot for,
//!    → `Error(InvalidProduceKind)`
//! 4. modify that leaves its slot unchanged → `Pass`
//! 5. permission gating (drops modify, tags, or reject)
//! 6. no outcome call → `Pass`

use async_trait::async_trait;

use crate::{
    CapabilityDeclaration, ExecutionFault, FaultKind, InputEnvelope, InvocationResult, Metadata,
    ParameterMap, ParameterSchema, Payload, PipelineError, ProcessorId, ProcessorName,
    ProcessorNamespace, ProcessorVersion, RejectCode, Rejection, Tags,
};

/// Error type a processor may return from [`Processor::process`].
pub type ProcessorFault = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Static identity and capability of a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorDescriptor {
    namespace: ProcessorNamespace,
    name: ProcessorName,
    version: ProcessorVersion,
    description: Option<String>,
    capability: CapabilityDeclaration,
    parameters: ParameterSchema,
}

impl ProcessorDescriptor {
    pub fn new(
        namespace: ProcessorNamespace,
        name: ProcessorName,
        version: ProcessorVersion,
        capability: CapabilityDeclaration,
    ) -> Self {
        Self {
            namespace,
            name,
            version,
            description: None,
            capability,
            parameters: ParameterSchema::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares the settings a caller may override per request.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ParameterSchema) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn id(&self) -> ProcessorId {
        ProcessorId::new(self.namespace.clone(), self.name.clone())
    }

    pub fn namespace(&self) -> &ProcessorNamespace {
        &self.namespace
    }

    pub fn name(&self) -> &ProcessorName {
        &self.name
    }

    pub fn version(&self) -> &ProcessorVersion {
        &self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn capability(&self) -> &CapabilityDeclaration {
        &self.capability
    }

    pub fn parameters(&self) -> &ParameterSchema {
        &self.parameters
    }

    /// Route path for executing this processor, lower-cased.
    pub fn execute_path(&self) -> String {
        format!("/execute/{}/{}", self.namespace, self.name).to_lowercase()
    }

    /// Route path for this processor's signature, lower-cased.
    pub fn signature_path(&self) -> String {
        format!("/signature/{}/{}", self.namespace, self.name).to_lowercase()
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// What a processor is allowed to do during one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Permissions {
    /// Tags may be added.
    pub annotate: bool,
    /// The payload may be modified.
    pub modify: bool,
    /// The traffic may be rejected.
    pub reject: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            annotate: true,
            modify: true,
            reject: true,
        }
    }
}

impl Permissions {
    /// Grants only what both sides grant.
    #[must_use]
    pub fn intersect(self, other: Permissions) -> Permissions {
        Permissions {
            annotate: self.annotate && other.annotate,
            modify: self.modify && other.modify,
            reject: self.reject && other.reject,
        }
    }
}

// ---------------------------------------------------------------------------
// Processor trait
// ---------------------------------------------------------------------------

/// A pluggable unit of inspection and transformation logic.
///
/// Implementations must be safe to call concurrently: any state they hold is
/// created at construction and is read-only or internally synchronised.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use pipeline::{InputEnvelope, InvocationContext, Processor, ProcessorDescriptor, ProcessorFault};
///
/// struct Noop(ProcessorDescriptor);
///
/// #[async_trait]
/// impl Processor for Noop {
///     fn descriptor(&self) -> &ProcessorDescriptor {
///         &self.0
///     }
///
///     async fn process(
///         &self,
///         _envelope: &InputEnvelope,
///         ctx: &mut InvocationContext,
///     ) -> Result<(), ProcessorFault> {
///         ctx.pass();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Identity and capability, fixed for the processor's lifetime.
    fn descriptor(&self) -> &ProcessorDescriptor;

    /// Inspects `envelope` and records an outcome on `ctx`.
    ///
    /// Returning normally without an outcome call means pass. Returning an
    /// error, or panicking, yields an `Unhandled` error result.
    async fn process(
        &self,
        envelope: &InputEnvelope,
        ctx: &mut InvocationContext,
    ) -> Result<(), ProcessorFault>;
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Pass,
    Modify(Payload),
    Reject(Rejection),
}

/// Scoped, write-once accumulator for one invocation.
#[derive(Debug)]
pub struct InvocationContext {
    permissions: Permissions,
    parameters: ParameterMap,
    decision: Option<Decision>,
    conflict: Option<String>,
    tags: Tags,
    metadata: Metadata,
}

impl InvocationContext {
    pub fn new(permissions: Permissions) -> Self {
        Self {
            permissions,
            parameters: ParameterMap::new(),
            decision: None,
            conflict: None,
            tags: Tags::new(),
            metadata: Metadata::new(),
        }
    }

    /// Attaches the caller's per-request parameters, already validated
    /// against the processor's schema.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = parameters;
        self
    }

    /// Permissions this invocation runs under.
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Per-request parameters. Empty when the caller sent none.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// Records an explicit pass.
    pub fn pass(&mut self) {
        self.decide(Decision::Pass);
    }

    /// Records a policy rejection with the default code.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.reject_with(RejectCode::default(), reason);
    }

    pub fn reject_with(&mut self, code: RejectCode, reason: impl Into<String>) {
        self.decide(Decision::Reject(Rejection {
            code,
            reason: reason.into(),
        }));
    }

    /// Records a replacement payload.
    pub fn modify(&mut self, payload: impl Into<Payload>) {
        self.decide(Decision::Modify(payload.into()));
    }

    /// Adds tag values under `key`.
    pub fn add_tag<I, S>(&mut self, key: &str, values: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.add(key, values)
    }

    /// Adds a value-less tag.
    pub fn flag(&mut self, key: &str) -> Result<(), PipelineError> {
        self.tags.insert(key)
    }

    /// Adds a metadata entry. A key may be written only once per invocation.
    pub fn insert_metadata(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), PipelineError> {
        self.metadata.insert(key, value)
    }

    fn decide(&mut self, decision: Decision) {
        match &self.decision {
            None => self.decision = Some(decision),
            Some(previous) if self.conflict.is_none() => {
                self.conflict = Some(format!(
                    "outcome already recorded as {}; ignoring later {}",
                    label(previous),
                    label(&decision)
                ));
            }
            Some(_) => {}
        }
    }

    /// Freezes the context into exactly one result.
    ///
    /// `returned` is what [`Processor::process`] returned. See the module
    /// documentation for the order in which checks are applied.
    pub fn finish(
        self,
        processor: ProcessorId,
        envelope: &InputEnvelope,
        capability: &CapabilityDeclaration,
        returned: Result<(), ProcessorFault>,
    ) -> InvocationResult {
        if let Err(fault) = returned {
            return InvocationResult::error(
                processor,
                ExecutionFault::new(FaultKind::Unhandled, fault.to_string()),
            );
        }

        if let Some(conflict) = self.conflict {
            return InvocationResult::error(
                processor,
                ExecutionFault::new(FaultKind::Unhandled, conflict),
            );
        }

        let Self {
            permissions,
            decision,
            mut tags,
            metadata,
            ..
        } = self;

        let mut decision = decision.unwrap_or(Decision::Pass);

        if let Decision::Modify(payload) = &decision {
            let kind = payload.kind();
            let detail = if !capability.can_produce(kind) {
                Some(format!("processor {processor} emitted '{kind}' but does not declare it"))
            } else if !envelope.accepts(kind) {
                Some(format!(
                    "processor {processor} emitted '{kind}' for a {} envelope",
                    envelope.item_kind()
                ))
            } else {
                None
            };
            if let Some(detail) = detail {
                return InvocationResult::error(
                    processor,
                    ExecutionFault::new(FaultKind::InvalidProduceKind, detail),
                );
            }
        }

        let unchanged = matches!(&decision, Decision::Modify(payload) if envelope.holds(payload));
        if unchanged {
            tracing::debug!(processor = %processor, "modification equals input; treating as pass");
            decision = Decision::Pass;
        }

        if !permissions.annotate && !tags.is_empty() {
            tracing::warn!(processor = %processor, "tags dropped: annotate not permitted");
            tags = Tags::new();
        }

        match decision {
            Decision::Modify(_) if !permissions.modify => {
                tracing::warn!(processor = %processor, "modification dropped: modify not permitted");
                InvocationResult::pass(processor, tags, metadata)
            }
            Decision::Reject(_) if !permissions.reject => {
                tracing::warn!(processor = %processor, "rejection dropped: reject not permitted");
                InvocationResult::pass(processor, tags, metadata)
            }
            Decision::Pass => InvocationResult::pass(processor, tags, metadata),
            Decision::Modify(payload) => {
                InvocationResult::modify(processor, payload, tags, metadata)
            }
            Decision::Reject(rejection) => {
                InvocationResult::reject(processor, rejection, tags, metadata)
            }
        }
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new(Permissions::default())
    }
}

fn label(decision: &Decision) -> &'static str {
    match decision {
        Decision::Pass => "pass",
        Decision::Modify(_) => "modify",
        Decision::Reject(_) => "reject",
    }
}
