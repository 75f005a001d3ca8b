//! The Execution Engine: runs one processor invocation to exactly one result.
//!
//! ## Lifecycle
//!
//! | Phase | Action |
//! |-------|--------|
//! | `Checking` | skip with `Pass` if the processor does not consume the item kind |
//! | `Running` | invoke under the budget's timeout, catching panics |
//! | `Finalizing` | normalise the outcome via [`InvocationContext::finish`] |
//!
//! Every fault inside the processor (returned error, panic, timeout) is
//! contained here and converted into an `Error` result. Nothing is retried.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use pipeline::{
    ExecutionBudget, ExecutionFault, FaultKind, InputEnvelope, InvocationContext, InvocationId,
    InvocationResult, Outcome, ParameterMap, Permissions, Processor,
};
use tracing::Instrument;

use crate::telemetry::{InvocationEvent, TelemetrySink};

/// Process-wide execution settings, loaded once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Budget applied when a caller does not supply one.
    pub budget: ExecutionBudget,
}

impl EngineConfig {
    pub fn new(budget: ExecutionBudget) -> Self {
        Self { budget }
    }
}

/// State of an invocation, used for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationPhase {
    Checking,
    Running,
    Finalizing,
}

impl InvocationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationPhase::Checking => "checking",
            InvocationPhase::Running => "running",
            InvocationPhase::Finalizing => "finalizing",
        }
    }
}

/// Runs processor invocations under a bounded execution contract.
///
/// Cheap to clone; clones share the telemetry sink.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self { config, telemetry }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `processor` on `envelope` with full permissions.
    pub async fn execute(
        &self,
        envelope: &InputEnvelope,
        processor: &dyn Processor,
        budget: ExecutionBudget,
    ) -> InvocationResult {
        self.execute_with(envelope, processor, budget, Permissions::default())
            .await
    }

    /// Runs `processor` on `envelope` under `permissions`.
    pub async fn execute_with(
        &self,
        envelope: &InputEnvelope,
        processor: &dyn Processor,
        budget: ExecutionBudget,
        permissions: Permissions,
    ) -> InvocationResult {
        self.execute_with_parameters(envelope, processor, budget, permissions, ParameterMap::new())
            .await
    }

    /// Runs `processor` on `envelope` under `permissions`, exposing the
    /// caller's `parameters` through [`InvocationContext::parameters`].
    ///
    /// Always returns exactly one result and emits exactly one telemetry
    /// event.
    pub async fn execute_with_parameters(
        &self,
        envelope: &InputEnvelope,
        processor: &dyn Processor,
        budget: ExecutionBudget,
        permissions: Permissions,
        parameters: ParameterMap,
    ) -> InvocationResult {
        let invocation_id = InvocationId::new_random();
        let descriptor = processor.descriptor();
        let processor_id = descriptor.id();
        let item_kind = envelope.item_kind();

        let span = tracing::info_span!(
            "processor.invoke",
            invocation_id = %invocation_id,
            processor = %processor_id,
            item_kind = %item_kind,
        );

        async move {
            let started = Instant::now();
            let capability = descriptor.capability();

            tracing::debug!(phase = InvocationPhase::Checking.as_str(), "checking applicability");
            if !capability.can_consume(item_kind) {
                tracing::debug!(
                    phase = InvocationPhase::Checking.as_str(),
                    "item kind not consumed; skipping"
                );
                let result = InvocationResult::skipped(processor_id.clone());
                self.emit(invocation_id, &result, item_kind, started, true);
                return result;
            }

            tracing::debug!(
                phase = InvocationPhase::Running.as_str(),
                timeout_ms = budget.timeout().as_millis() as u64,
                "invoking processor"
            );
            let mut ctx = InvocationContext::new(permissions).with_parameters(parameters);
            let run = tokio::time::timeout(
                budget.timeout(),
                AssertUnwindSafe(processor.process(envelope, &mut ctx)).catch_unwind(),
            )
            .await;

            tracing::debug!(phase = InvocationPhase::Finalizing.as_str(), "normalising outcome");
            let result = match run {
                Err(_elapsed) => InvocationResult::error(
                    processor_id.clone(),
                    ExecutionFault::new(
                        FaultKind::Timeout,
                        format!(
                            "invocation exceeded {}ms budget",
                            budget.timeout().as_millis()
                        ),
                    ),
                ),
                Ok(Err(panic_payload)) => {
                    let message = panic_message(panic_payload.as_ref());
                    tracing::error!(panic_message = %message, "processor panicked");
                    InvocationResult::error(
                        processor_id.clone(),
                        ExecutionFault::new(
                            FaultKind::Unhandled,
                            format!("processor panicked: {message}"),
                        ),
                    )
                }
                Ok(Ok(returned)) => {
                    if let Err(err) = &returned {
                        tracing::error!(error = %err, "processor returned error");
                    }
                    ctx.finish(processor_id.clone(), envelope, capability, returned)
                }
            };

            if let Outcome::Error(fault) = result.outcome() {
                if fault.kind == FaultKind::InvalidProduceKind {
                    tracing::error!(detail = %fault.detail, "processor emitted an undeclared payload kind");
                }
            }

            self.emit(invocation_id, &result, item_kind, started, false);
            result
        }
        .instrument(span)
        .await
    }

    fn emit(
        &self,
        invocation_id: InvocationId,
        result: &InvocationResult,
        item_kind: pipeline::ItemKind,
        started: Instant,
        skipped: bool,
    ) {
        let fault = match result.outcome() {
            Outcome::Error(fault) => Some(fault.clone()),
            _ => None,
        };
        self.telemetry.record(&InvocationEvent {
            invocation_id,
            processor: result.processor().clone(),
            item_kind,
            outcome: result.outcome().kind(),
            duration: started.elapsed(),
            skipped,
            fault,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
