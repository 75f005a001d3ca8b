//! Prompt-injection policy: rejects prompts that match a known injection
//! phrase.

use async_trait::async_trait;
use pipeline::{
    CapabilityDeclaration, InputEnvelope, InvocationContext, ItemKind, Payload, Processor,
    ProcessorDescriptor, ProcessorFault, RejectCode,
};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::{FactoryError, ProcessorIdentity};

/// Pattern used when no `pattern` setting is configured.
pub const DEFAULT_INJECTION_PATTERN: &str = r"ignore\s+(all\s+)?previous\s+instructions";

/// Reason attached to every rejection from this processor.
pub const INJECTION_REJECT_REASON: &str = "policy violation: prompt injection pattern";

/// Settings accepted under `[processors.settings]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptInjectionSettings {
    /// Case-insensitive regular expression matched against the whole prompt.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Rejects prompts containing an injection phrase. Never modifies traffic or
/// writes metadata.
#[derive(Debug)]
pub struct PromptInjectionPolicy {
    descriptor: ProcessorDescriptor,
    pattern: Regex,
}

impl PromptInjectionPolicy {
    pub fn new(
        identity: ProcessorIdentity,
        settings: PromptInjectionSettings,
    ) -> Result<Self, FactoryError> {
        let source = settings
            .pattern
            .as_deref()
            .unwrap_or(DEFAULT_INJECTION_PATTERN);
        let pattern = RegexBuilder::new(source)
            .case_insensitive(true)
            .build()
            .map_err(|source| FactoryError::InvalidPattern {
                processor: identity.to_string(),
                source,
            })?;
        let capability = CapabilityDeclaration::declare([ItemKind::Prompt], [])?;
        Ok(Self {
            descriptor: identity
                .into_descriptor(capability)
                .with_description("Rejects prompts that contain a prompt-injection phrase."),
            pattern,
        })
    }
}

#[async_trait]
impl Processor for PromptInjectionPolicy {
    fn descriptor(&self) -> &ProcessorDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        envelope: &InputEnvelope,
        ctx: &mut InvocationContext,
    ) -> Result<(), ProcessorFault> {
        let Payload::Prompt(prompt) = envelope.payload() else {
            return Ok(());
        };

        if self.pattern.is_match(&prompt.concatenate(&[])) {
            tracing::debug!(processor = %self.descriptor.id(), "injection pattern matched");
            ctx.reject_with(RejectCode::PolicyViolation, INJECTION_REJECT_REASON);
        }
        Ok(())
    }
}
