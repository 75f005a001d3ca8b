//! Service configuration loaded from a TOML file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:9999"
//! api_root = ""
//! pipeline = true
//!
//! [execution]
//! invocation_timeout_ms = 2000
//! request_timeout_ms = 5000
//!
//! [telemetry]
//! log_format = "json"
//! log_filter = "info"
//! otlp_endpoint = "http://localhost:4317"
//! service_name = "aigw-processor"
//!
//! [[processors]]
//! kind = "prompt_injection"
//! namespace = "policy"
//! name = "prompt-injection"
//! reject = true
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pipeline::{ExecutionBudget, Permissions};
use processors::ProcessorSpec;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the expected layout.
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parsed but are not usable together.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9999))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Prefix for every route. Empty mounts at `/`.
    #[serde(default)]
    pub api_root: String,
    /// Serve the configured processors as one pipeline on `/api/v1/execute`.
    #[serde(default = "default_true")]
    pub pipeline: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_root: String::new(),
            pipeline: true,
        }
    }
}

fn default_invocation_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSection {
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
    /// Whole-request ceiling for the pipeline route. Unset means unbounded.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: default_invocation_timeout_ms(),
            request_timeout_ms: None,
        }
    }
}

impl ExecutionSection {
    pub fn budget(&self) -> Result<ExecutionBudget, ConfigError> {
        let budget = ExecutionBudget::new(Duration::from_millis(self.invocation_timeout_ms))
            .ok_or_else(|| {
                ConfigError::Invalid("execution.invocation_timeout_ms must be positive".into())
            })?;
        match self.request_timeout_ms {
            None => Ok(budget),
            Some(ms) => budget
                .with_request_timeout(Duration::from_millis(ms))
                .ok_or_else(|| {
                    ConfigError::Invalid("execution.request_timeout_ms must be positive".into())
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "aigw-processor".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    #[serde(default)]
    pub log_format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// OTLP gRPC endpoint. Span export is off when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
            otlp_endpoint: None,
            service_name: default_service_name(),
        }
    }
}

/// One `[[processors]]` entry: what to build plus how it may act inside the
/// pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEntry {
    #[serde(flatten)]
    pub spec: ProcessorSpec,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub annotate: bool,
    #[serde(default = "default_true")]
    pub modify: bool,
    #[serde(default = "default_true")]
    pub reject: bool,
}

impl ProcessorEntry {
    pub fn permissions(&self) -> Permissions {
        Permissions {
            annotate: self.annotate,
            modify: self.modify,
            reject: self.reject,
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub processors: Vec<ProcessorEntry>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn enabled_processors(&self) -> impl Iterator<Item = &ProcessorEntry> {
        self.processors.iter().filter(|entry| entry.enabled)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.api_root.is_empty() && !self.server.api_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.api_root must start with '/', got '{}'",
                self.server.api_root
            )));
        }
        if self.enabled_processors().next().is_none() {
            return Err(ConfigError::Invalid(
                "at least one enabled [[processors]] entry is required".into(),
            ));
        }
        self.execution.budget()?;
        Ok(())
    }
}
