//! Processor execution engine and pipeline executor.
//!
//! This crate runs processors: it checks applicability, bounds each invocation
//! with a timeout, contains panics and returned errors, and folds results into
//! pipeline state in declared order.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between the domain
//! rules in the [`pipeline`] crate and processor implementations. It contains
//! no domain rules of its own; normalisation and composition live in
//! [`pipeline`].
//!
//! ## Concurrency
//!
//! One request's stages run strictly one after another. Independent requests
//! run concurrently: [`ExecutionEngine`] and [`PipelineExecutor`] hold no
//! per-request mutable state and are shared behind `Arc`s.

pub mod engine;
pub mod executor;
pub mod telemetry;

pub use engine::{EngineConfig, ExecutionEngine, InvocationPhase};
pub use executor::{PipelineExecutor, Stage};
pub use telemetry::{InvocationEvent, TelemetrySink, TracingTelemetry};
