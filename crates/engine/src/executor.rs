//! Sequential pipeline executor.
//!
//! Runs each stage in declared order, folding every result into the
//! accumulated [`PipelineState`] with [`pipeline::compose`]. The first reject
//! or error stops the run; later stages are never invoked.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use pipeline::{
    compose, ExecutionBudget, ExecutionFault, FaultKind, InputEnvelope, ParameterMap, Permissions,
    PipelineError, PipelineResult, PipelineState, Processor,
};
use tracing::Instrument;

use crate::ExecutionEngine;

/// One processor in a pipeline plus the permissions it runs under.
#[derive(Clone)]
pub struct Stage {
    pub processor: Arc<dyn Processor>,
    pub permissions: Permissions,
}

impl Stage {
    /// A stage with full permissions.
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self {
            processor,
            permissions: Permissions::default(),
        }
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// The entries of `parameters` this stage's processor declares.
    pub fn parameters(&self, parameters: &ParameterMap) -> ParameterMap {
        let schema = self.processor.descriptor().parameters();
        parameters
            .iter()
            .filter(|(name, _)| schema.fields().iter().any(|f| &f.name == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("processor", &self.processor.descriptor().id())
            .field("permissions", &self.permissions)
            .finish()
    }
}

/// An ordered, validated list of stages.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    engine: ExecutionEngine,
    stages: Vec<Stage>,
}

impl PipelineExecutor {
    /// Validates the wiring and builds the executor.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ConfigurationError`] when two stages share a
    /// processor id.
    pub fn new(engine: ExecutionEngine, stages: Vec<Stage>) -> Result<Self, PipelineError> {
        let mut seen = BTreeSet::new();
        for stage in &stages {
            let id = stage.processor.descriptor().id();
            if !seen.insert(id.clone()) {
                return Err(PipelineError::configuration(format!(
                    "processor {id} appears more than once in the pipeline"
                )));
            }
        }
        Ok(Self { engine, stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Runs the pipeline with the engine's configured budget.
    pub async fn run(&self, envelope: InputEnvelope) -> PipelineResult {
        self.run_with_budget(envelope, self.engine.config().budget)
            .await
    }

    /// Runs every stage in order against `envelope`.
    ///
    /// Each stage gets the per-invocation timeout clamped to whatever is left
    /// of the request timeout. When the request timeout runs out between
    /// stages, the run ends with `Error(Timeout)` attributed to the stage that
    /// would have run next.
    pub async fn run_with_budget(
        &self,
        envelope: InputEnvelope,
        budget: ExecutionBudget,
    ) -> PipelineResult {
        self.run_within(envelope, budget, Permissions::default(), &ParameterMap::new())
            .await
    }

    /// Like [`run_with_budget`](Self::run_with_budget), with every stage's
    /// permissions narrowed to `limit` for this run only. Each stage receives
    /// the entries of `parameters` its descriptor declares.
    pub async fn run_within(
        &self,
        envelope: InputEnvelope,
        budget: ExecutionBudget,
        limit: Permissions,
        parameters: &ParameterMap,
    ) -> PipelineResult {
        let span = tracing::info_span!(
            "pipeline.run",
            stages = self.stages.len(),
            item_kind = %envelope.item_kind(),
        );

        async move {
            let started = Instant::now();
            let mut state = PipelineState::new(envelope);

            for stage in &self.stages {
                let Some(step_budget) = budget.for_step(started.elapsed()) else {
                    let id = stage.processor.descriptor().id();
                    tracing::warn!(processor = %id, "request budget exhausted before stage");
                    state = state.halt(
                        id,
                        ExecutionFault::new(FaultKind::Timeout, "request budget exhausted"),
                    );
                    break;
                };

                let result = self
                    .engine
                    .execute_with_parameters(
                        state.envelope(),
                        stage.processor.as_ref(),
                        step_budget,
                        stage.permissions.intersect(limit),
                        stage.parameters(parameters),
                    )
                    .await;
                state = compose(state, result);

                if state.is_terminal() {
                    break;
                }
            }

            let result = state.into_result();
            tracing::info!(
                outcome = %result.outcome.kind(),
                steps = result.provenance.len(),
                tags = result.tags_added.len(),
                metadata = result.metadata_added.len(),
                "pipeline run completed"
            );
            result
        }
        .instrument(span)
        .await
    }
}
