//! Result Composition: folding invocation results into pipeline state.
//!
//! ## Architectural Layer
//!
//! **Pure domain logic.** [`compose`] takes the accumulated state by value and
//! returns the next state. It performs no I/O and never invokes processors; the
//! executor in the `engine` crate decides whether to run the next step by
//! checking [`PipelineState::is_terminal`].
//!
//! ## Rules
//!
//! | Outcome | Effect |
//! |---------|--------|
//! | `Pass` | deltas merged, provenance recorded |
//! | `Modify` | the slot of the produced kind replaced in a derived envelope, deltas merged |
//! | `Reject` | own deltas merged, prior deltas retained, state becomes terminal |
//! | `Error` | state becomes terminal, nothing merged |
//!
//! A metadata key that is already present, from the inbound request or any
//! earlier step, turns the step into `Error(MetadataCollision)` and leaves the
//! previous snapshot in place. A modification the envelope has no slot for
//! becomes `Error(InvalidProduceKind)`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    ExecutionFault, FaultKind, InputEnvelope, InvocationResult, ItemKind, Metadata, Outcome,
    OutcomeKind, Payload, ProcessorId, Tags, Timestamp,
};

/// One line of the audit trail: which processor ran and what it decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub processor: ProcessorId,
    pub outcome: OutcomeKind,
    pub note: String,
    pub recorded_at: Timestamp,
}

/// Accumulated state of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    envelope: InputEnvelope,
    tags_added: Tags,
    metadata_added: Metadata,
    modified: BTreeSet<ItemKind>,
    terminal: Option<Outcome>,
    provenance: Vec<ProvenanceRecord>,
}

impl PipelineState {
    /// Starts a run from the inbound envelope.
    pub fn new(envelope: InputEnvelope) -> Self {
        Self {
            envelope,
            tags_added: Tags::new(),
            metadata_added: Metadata::new(),
            modified: BTreeSet::new(),
            terminal: None,
            provenance: Vec::new(),
        }
    }

    /// The envelope the next step will see.
    pub fn envelope(&self) -> &InputEnvelope {
        &self.envelope
    }

    pub fn tags_added(&self) -> &Tags {
        &self.tags_added
    }

    pub fn metadata_added(&self) -> &Metadata {
        &self.metadata_added
    }

    pub fn provenance(&self) -> &[ProvenanceRecord] {
        &self.provenance
    }

    /// `true` once a step rejected or errored.
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal(&self) -> Option<&Outcome> {
        self.terminal.as_ref()
    }

    /// Ends the run with an error that did not come from a processor result,
    /// such as an exhausted request budget.
    #[must_use]
    pub fn halt(mut self, processor: ProcessorId, fault: ExecutionFault) -> Self {
        if self.terminal.is_none() {
            self.record(&processor, OutcomeKind::Error, fault.detail.clone());
            self.terminal = Some(Outcome::Error(fault));
        }
        self
    }

    /// Converts the state into the pipeline's outbound result.
    ///
    /// A run that ended without reject or error reports `Modify` if any step
    /// modified a slot, `Pass` otherwise. Every modified slot is listed in
    /// [`PipelineResult::modifications`], payload first; the `Modify`
    /// outcome carries the first of them.
    pub fn into_result(self) -> PipelineResult {
        let modifications: Vec<Payload> = match self.terminal {
            Some(_) => Vec::new(),
            None => self
                .modified
                .iter()
                .filter_map(|kind| self.envelope.slot(*kind))
                .collect(),
        };
        let outcome = match (self.terminal, modifications.first()) {
            (Some(outcome), _) => outcome,
            (None, Some(first)) => Outcome::Modify(first.clone()),
            (None, None) => Outcome::Pass,
        };
        PipelineResult {
            outcome,
            modifications,
            tags_added: self.tags_added,
            metadata_added: self.metadata_added,
            provenance: self.provenance,
        }
    }

    fn record(&mut self, processor: &ProcessorId, outcome: OutcomeKind, note: impl Into<String>) {
        self.provenance.push(ProvenanceRecord {
            processor: processor.clone(),
            outcome,
            note: note.into(),
            recorded_at: Timestamp::now(),
        });
    }

    fn collide(mut self, processor: &ProcessorId, key: String) -> Self {
        let detail = format!("metadata key '{key}' from {processor} is already present");
        self.record(processor, OutcomeKind::Error, detail.clone());
        self.terminal = Some(Outcome::Error(ExecutionFault::new(
            FaultKind::MetadataCollision,
            detail,
        )));
        self
    }

    fn absorb(&mut self, tags: &Tags, metadata: &Metadata) -> Result<(), String> {
        let next = self
            .envelope
            .with_deltas(tags, metadata)
            .map_err(|err| match err {
                crate::PipelineError::MetadataCollision { key } => key,
                other => other.to_string(),
            })?;
        self.envelope = next;
        self.tags_added.merge(tags);
        // Cannot collide: every key in metadata_added is also in the envelope.
        let _ = self.metadata_added.merge_strict(metadata);
        Ok(())
    }
}

/// Final, outbound result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub outcome: Outcome,
    /// Final content of every modified slot. Empty unless `outcome` is
    /// `Modify`.
    pub modifications: Vec<Payload>,
    pub tags_added: Tags,
    pub metadata_added: Metadata,
    pub provenance: Vec<ProvenanceRecord>,
}

/// Folds one invocation result into the accumulated state.
///
/// Once the state is terminal it is returned unchanged.
pub fn compose(state: PipelineState, result: InvocationResult) -> PipelineState {
    if state.is_terminal() {
        return state;
    }

    let (processor, outcome, tags, metadata) = result.into_parts();
    let mut state = state;

    match outcome {
        Outcome::Pass => {
            if let Err(key) = state.absorb(&tags, &metadata) {
                return state.collide(&processor, key);
            }
            state.record(&processor, OutcomeKind::Pass, "ran, no-op");
        }
        Outcome::Modify(payload) => {
            let kind = payload.kind();
            if !state.envelope.accepts(kind) {
                let fault = ExecutionFault::new(
                    FaultKind::InvalidProduceKind,
                    format!(
                        "{processor} produced '{kind}' but a {} envelope has no slot for it",
                        state.envelope.item_kind()
                    ),
                );
                return compose(state, InvocationResult::error(processor, fault));
            }
            let snapshot = state.envelope.clone();
            state.envelope = snapshot.derive(payload);
            if let Err(key) = state.absorb(&tags, &metadata) {
                state.envelope = snapshot;
                return state.collide(&processor, key);
            }
            state.modified.insert(kind);
            state.record(&processor, OutcomeKind::Modify, format!("replaced {kind} payload"));
        }
        Outcome::Reject(rejection) => {
            if let Err(key) = state.absorb(&tags, &metadata) {
                return state.collide(&processor, key);
            }
            state.record(
                &processor,
                OutcomeKind::Reject,
                format!("{}: {}", rejection.code, rejection.reason),
            );
            state.terminal = Some(Outcome::Reject(rejection));
        }
        Outcome::Error(fault) => {
            state.record(
                &processor,
                OutcomeKind::Error,
                format!("{}: {}", fault.kind, fault.detail),
            );
            state.terminal = Some(Outcome::Error(fault));
        }
    }

    state
}
