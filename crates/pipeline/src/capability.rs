//! Capability declarations: which item kinds a processor reads and writes.
//!
//! Declarations are validated once, at processor construction. The engine
//! relies on them to skip processors for kinds they do not handle and to
//! refuse modifications of a kind the processor never declared.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ItemKind, PipelineError};

/// Cross-kind transforms a processor may declare without consuming the
/// target kind. Anything not listed here (e.g. Embedding to Prompt) must be
/// consumed to be produced.
pub const WELL_KNOWN_TRANSFORMS: &[(ItemKind, ItemKind)] = &[
    (ItemKind::Prompt, ItemKind::Parameters),
    (ItemKind::Response, ItemKind::Parameters),
];

/// The item kinds a processor consumes and may produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    consumes: BTreeSet<ItemKind>,
    produces: BTreeSet<ItemKind>,
}

impl CapabilityDeclaration {
    /// Validates and builds a declaration.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ConfigurationError`] when `consumes` is empty,
    /// or when a produced kind is neither consumed nor reachable from a
    /// consumed kind through [`WELL_KNOWN_TRANSFORMS`].
    pub fn declare(
        consumes: impl IntoIterator<Item = ItemKind>,
        produces: impl IntoIterator<Item = ItemKind>,
    ) -> Result<Self, PipelineError> {
        let consumes: BTreeSet<ItemKind> = consumes.into_iter().collect();
        let produces: BTreeSet<ItemKind> = produces.into_iter().collect();

        if consumes.is_empty() {
            return Err(PipelineError::configuration(
                "a processor must consume at least one item kind",
            ));
        }

        for target in &produces {
            let reachable = consumes.contains(target)
                || WELL_KNOWN_TRANSFORMS
                    .iter()
                    .any(|(from, to)| to == target && consumes.contains(from));
            if !reachable {
                return Err(PipelineError::configuration(format!(
                    "cannot produce '{target}' from {}",
                    describe(&consumes)
                )));
            }
        }

        Ok(Self { consumes, produces })
    }

    pub fn consumes(&self) -> &BTreeSet<ItemKind> {
        &self.consumes
    }

    pub fn produces(&self) -> &BTreeSet<ItemKind> {
        &self.produces
    }

    pub fn can_consume(&self, kind: ItemKind) -> bool {
        self.consumes.contains(&kind)
    }

    pub fn can_produce(&self, kind: ItemKind) -> bool {
        self.produces.contains(&kind)
    }

    /// Describes the multipart fields this processor accepts.
    ///
    /// A field is marked required when it is the only stage the processor
    /// handles.
    pub fn signature(&self) -> Vec<SignatureField> {
        let stages: Vec<(ItemKind, &'static str)> = [
            (ItemKind::Prompt, "input.messages"),
            (ItemKind::Response, "response.choices"),
            (ItemKind::Embedding, "input.embeddings"),
        ]
        .into_iter()
        .filter(|(kind, _)| self.consumes.contains(kind))
        .collect();

        let required = stages.len() == 1;
        stages
            .into_iter()
            .map(|(kind, field)| SignatureField {
                field: field.to_string(),
                kind,
                required,
            })
            .collect()
    }
}

/// One multipart field a processor accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureField {
    /// Multipart part name (e.g. `input.messages`).
    pub field: String,
    /// Item kind carried by the field.
    pub kind: ItemKind,
    /// Whether a request must include this field.
    pub required: bool,
}

fn describe(kinds: &BTreeSet<ItemKind>) -> String {
    let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
    format!("{{{}}}", names.join(", "))
}
