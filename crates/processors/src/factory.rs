//! Builds reference processors from configuration.
//!
//! The composition root deserialises one [`ProcessorSpec`] per configured
//! processor and hands it to [`build_processor`]. Every failure here is a
//! startup error; nothing in this module runs on the request path.

use std::sync::Arc;

use pipeline::{
    CapabilityDeclaration, PipelineError, Processor, ProcessorDescriptor, ProcessorName,
    ProcessorNamespace, ProcessorVersion,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::{KeywordTagger, NumericRounding, PromptInjectionPolicy};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while constructing a processor from configuration.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// A namespace, name, or version was empty or contained whitespace.
    #[error("Invalid processor {field} '{value}': must be non-empty and contain no whitespace")]
    InvalidIdentity {
        /// Which identity field was rejected.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The `settings` table did not match what the processor kind expects.
    #[error("Invalid settings for processor {processor}: {message}")]
    InvalidSettings {
        /// Processor id (`namespace:name`).
        processor: String,
        /// What was wrong.
        message: String,
    },

    /// A regular expression setting failed to compile.
    #[error("Invalid pattern for processor {processor}: {source}")]
    InvalidPattern {
        /// Processor id (`namespace:name`).
        processor: String,
        /// Compilation error from the regex engine.
        #[source]
        source: regex::Error,
    },

    /// The processor declared an invalid capability.
    #[error(transparent)]
    Capability(#[from] PipelineError),
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Validated namespace, name, and version of a processor being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorIdentity {
    pub namespace: ProcessorNamespace,
    pub name: ProcessorName,
    pub version: ProcessorVersion,
}

impl ProcessorIdentity {
    /// Validates raw identity strings.
    pub fn parse(namespace: &str, name: &str, version: &str) -> Result<Self, FactoryError> {
        let invalid = |field: &'static str, value: &str| FactoryError::InvalidIdentity {
            field,
            value: value.to_string(),
        };
        Ok(Self {
            namespace: ProcessorNamespace::new(namespace)
                .ok_or_else(|| invalid("namespace", namespace))?,
            name: ProcessorName::new(name).ok_or_else(|| invalid("name", name))?,
            version: ProcessorVersion::new(version).ok_or_else(|| invalid("version", version))?,
        })
    }

    /// Combines the identity with a capability into a descriptor.
    pub fn into_descriptor(self, capability: CapabilityDeclaration) -> ProcessorDescriptor {
        ProcessorDescriptor::new(self.namespace, self.name, self.version, capability)
    }
}

impl std::fmt::Display for ProcessorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which reference processor to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    PromptInjection,
    NumericRounding,
    KeywordTagger,
}

fn default_version() -> String {
    "v1".to_string()
}

/// Configuration for one processor instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessorSpec {
    pub kind: ProcessorKind,
    pub namespace: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Kind-specific settings. Absent means defaults.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Builds the processor described by `spec`.
pub fn build_processor(spec: &ProcessorSpec) -> Result<Arc<dyn Processor>, FactoryError> {
    let identity = ProcessorIdentity::parse(&spec.namespace, &spec.name, &spec.version)?;
    tracing::debug!(processor = %identity, kind = ?spec.kind, "building processor");

    let processor: Arc<dyn Processor> = match spec.kind {
        ProcessorKind::PromptInjection => {
            let settings = settings(&identity, &spec.settings)?;
            Arc::new(PromptInjectionPolicy::new(identity, settings)?)
        }
        ProcessorKind::NumericRounding => {
            let settings = settings(&identity, &spec.settings)?;
            Arc::new(NumericRounding::new(identity, settings)?)
        }
        ProcessorKind::KeywordTagger => {
            let settings = settings(&identity, &spec.settings)?;
            Arc::new(KeywordTagger::new(identity, settings)?)
        }
    };
    Ok(processor)
}

fn settings<T>(identity: &ProcessorIdentity, raw: &serde_json::Value) -> Result<T, FactoryError>
where
    T: DeserializeOwned + Default,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone()).map_err(|err| FactoryError::InvalidSettings {
        processor: identity.to_string(),
        message: err.to_string(),
    })
}
