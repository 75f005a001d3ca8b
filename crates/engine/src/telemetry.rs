//! Invocation telemetry.
//!
//! The execution engine reports exactly one [`InvocationEvent`] per
//! invocation to a [`TelemetrySink`]. The schema of whatever the sink exports
//! is the sink's concern; [`TracingTelemetry`] turns each event into a
//! structured `tracing` event, which the binary routes to stdout and,
//! optionally, to an OpenTelemetry collector.

use std::time::Duration;

use pipeline::{ExecutionFault, InvocationId, ItemKind, OutcomeKind, ProcessorId};
use serde::Serialize;

/// What happened during one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationEvent {
    pub invocation_id: InvocationId,
    pub processor: ProcessorId,
    pub item_kind: ItemKind,
    pub outcome: OutcomeKind,
    pub duration: Duration,
    /// `true` when the processor was not invoked because it does not consume
    /// the envelope's item kind.
    pub skipped: bool,
    pub fault: Option<ExecutionFault>,
}

/// Receives invocation events.
///
/// Implementations must not block: `record` is called on the request path.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &InvocationEvent);
}

/// Sink that emits each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &InvocationEvent) {
        let duration_ms = event.duration.as_secs_f64() * 1000.0;
        match &event.fault {
            Some(fault) => tracing::warn!(
                invocation_id = %event.invocation_id,
                processor = %event.processor,
                item_kind = %event.item_kind,
                outcome = %event.outcome,
                duration_ms,
                skipped = event.skipped,
                fault_kind = %fault.kind,
                fault_detail = %fault.detail,
                "processor invocation failed"
            ),
            None => tracing::info!(
                invocation_id = %event.invocation_id,
                processor = %event.processor,
                item_kind = %event.item_kind,
                outcome = %event.outcome,
                duration_ms,
                skipped = event.skipped,
                "processor invocation completed"
            ),
        }
    }
}
