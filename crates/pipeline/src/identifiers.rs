//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`ProcessorName`] with a [`ProcessorNamespace`] even though both are
//! `String` under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes that appear in routes and telemetry.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// Empty values and values containing whitespace are refused.
// ---------------------------------------------------------------------------
macro_rules! token_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or contains whitespace.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() || v.chars().any(char::is_whitespace) {
                    None
                } else {
                    Some(Self(v))
                }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value.clone()).ok_or_else(|| {
                    format!(
                        "invalid {}: '{}' must be non-empty and contain no whitespace",
                        stringify!($name),
                        value
                    )
                })
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for plain String-wrapped newtypes supplied by the gateway.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers — processor naming
// ---------------------------------------------------------------------------

token_id! {
    /// Name of a processor, unique within its namespace (e.g. `"prompt-injection"`).
    ProcessorName
}

token_id! {
    /// Namespace grouping related processors (e.g. `"policy"`).
    ProcessorNamespace
}

token_id! {
    /// Version of a processor implementation, independent of the API version.
    ProcessorVersion
}

/// Fully-qualified processor identity: `"{namespace}:{name}"`.
///
/// Used as the provenance key during composition and as the `processor_id`
/// reported to the gateway and to telemetry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessorId {
    namespace: ProcessorNamespace,
    name: ProcessorName,
}

impl ProcessorId {
    /// Creates a processor identity from its namespace and name.
    pub fn new(namespace: ProcessorNamespace, name: ProcessorName) -> Self {
        Self { namespace, name }
    }

    /// Returns the namespace component.
    pub fn namespace(&self) -> &ProcessorNamespace {
        &self.namespace
    }

    /// Returns the name component.
    pub fn name(&self) -> &ProcessorName {
        &self.name
    }
}

impl std::fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Identifiers — UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single processor invocation.
///
/// Generated fresh by the execution engine for every invocation; propagated
/// through spans and telemetry events so all activity from one invocation can
/// be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Generates a new random invocation identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed (gateway-assigned)
// ---------------------------------------------------------------------------

string_id! {
    /// Gateway-assigned identifier of the inbound request, echoed back in
    /// response metadata when present.
    RequestId
}

string_id! {
    /// Gateway-assigned identifier of the pipeline step that dispatched this
    /// request to the processor.
    StepId
}
