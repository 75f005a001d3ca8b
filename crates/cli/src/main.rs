//! `aigw-processor` entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML file named by `--config` and
//!    apply command-line overrides.
//! 2. **Wire observability**: install the `tracing-subscriber` stack (JSON or
//!    pretty output, optional OTLP span export).
//! 3. **Construct processors**: build every enabled `[[processors]]` entry,
//!    host each on its own routes, and chain them into the pipeline route.
//! 4. **Serve**: run the axum server until Ctrl-C or SIGTERM, then drain
//!    in-flight requests and flush telemetry.

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use engine::{EngineConfig, ExecutionEngine, PipelineExecutor, Stage, TracingTelemetry};
use processors::build_processor;
use server::ProcessorRoutes;

use crate::config::{LogFormat, ServiceConfig};

#[derive(Debug, Parser)]
#[command(name = "aigw-processor", version, about = "Serve AI gateway processors over HTTP")]
struct Cli {
    /// Path to the service configuration file.
    #[arg(short, long, env = "AIGW_PROCESSOR_CONFIG", default_value = "config/processors.toml")]
    config: PathBuf,

    /// Overrides `server.bind`.
    #[arg(long, env = "AIGW_PROCESSOR_BIND")]
    bind: Option<SocketAddr>,

    /// Overrides `telemetry.log_format`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(format) = cli.log_format {
        config.telemetry.log_format = format;
    }

    let guard = telemetry::init(&config.telemetry).context("initialising telemetry")?;
    let result = serve(config).await;
    if let Err(err) = &result {
        tracing::error!("server stopped with an error: {err:#}");
    }
    guard.shutdown();
    result
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let budget = config.execution.budget()?;
    let engine = ExecutionEngine::new(EngineConfig::new(budget), Arc::new(TracingTelemetry));

    let mut routes = ProcessorRoutes::new(engine.clone()).with_root(&config.server.api_root);
    let mut stages = Vec::new();
    for entry in config.enabled_processors() {
        let processor = build_processor(&entry.spec)
            .with_context(|| format!("building processor {}:{}", entry.spec.namespace, entry.spec.name))?;
        tracing::info!(
            processor = %processor.descriptor().id(),
            version = %processor.descriptor().version(),
            path = %processor.descriptor().execute_path(),
            "processor registered"
        );
        routes = routes.with_processor(Arc::clone(&processor))?;
        stages.push(Stage::new(processor).with_permissions(entry.permissions()));
    }

    if config.server.pipeline {
        let executor = PipelineExecutor::new(engine, stages)?;
        tracing::info!(stages = executor.stages().len(), "pipeline route enabled");
        routes = routes.with_pipeline(executor);
    }

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(address = %config.server.bind, "processor server listening");

    axum::serve(listener, routes.into_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("processor server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
