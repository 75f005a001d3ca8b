//! HTTP routes for hosted processors.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | GET | `/` | redirect to the info route |
//! | GET, HEAD | `/api/v1/info` | processor listing (JSON, text, or markdown) |
//! | POST, HEAD | `/api/v1/execute/:namespace/:name` | run one processor (HEAD: 404 if unknown) |
//! | POST, HEAD | `/api/v1/execute` | run the configured pipeline (HEAD: 404 if none) |
//! | GET, POST | `/api/v1/signature/:namespace/:name` | field signature and parameter check |
//!
//! All paths sit under an optional root prefix.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use engine::{ExecutionEngine, PipelineExecutor};
use pipeline::{
    compose, ItemKind, ParameterMap, PipelineError, PipelineState, Processor, ProcessorDescriptor,
    ProcessorId,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::multipart::{self, Inbound, Origin};
use crate::wire::{self, WireParameters, WireRequest};
use crate::ServerError;

pub const API_VERSION: &str = "v1";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects processors and produces the router that serves them.
pub struct ProcessorRoutes {
    engine: ExecutionEngine,
    root: String,
    processors: Vec<Arc<dyn Processor>>,
    pipeline: Option<PipelineExecutor>,
}

impl ProcessorRoutes {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self {
            engine,
            root: String::new(),
            processors: Vec::new(),
            pipeline: None,
        }
    }

    /// Mounts every route under `root` (e.g. `/processors`).
    #[must_use]
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into().trim_end_matches('/').to_string();
        self
    }

    /// Hosts `processor` on its own execute and signature routes.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ConfigurationError`] when a processor with the same
    /// route is already hosted.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Result<Self, PipelineError> {
        let path = processor.descriptor().execute_path();
        if self
            .processors
            .iter()
            .any(|p| p.descriptor().execute_path() == path)
        {
            return Err(PipelineError::configuration(format!(
                "processor route {path} is already registered"
            )));
        }
        self.processors.push(processor);
        Ok(self)
    }

    /// Serves `executor` on the pipeline execute route.
    #[must_use]
    pub fn with_pipeline(mut self, executor: PipelineExecutor) -> Self {
        self.pipeline = Some(executor);
        self
    }

    pub fn into_router(self) -> Router {
        let api_prefix = format!("{}/api/{API_VERSION}", self.root);
        let state = AppState {
            inner: Arc::new(Inner {
                engine: self.engine,
                processors: self.processors,
                pipeline: self.pipeline,
                api_prefix,
            }),
        };

        let api = Router::new()
            .route("/", get(redirect_to_info))
            .route(
                "/api/v1/info",
                get(info).fallback(method_not_allowed),
            )
            .route(
                "/api/v1/execute",
                post(execute_pipeline)
                    .head(head_pipeline)
                    .fallback(method_not_allowed),
            )
            .route(
                "/api/v1/execute/:namespace/:name",
                post(execute_processor)
                    .head(head_processor)
                    .fallback(method_not_allowed),
            )
            .route(
                "/api/v1/signature/:namespace/:name",
                get(signature)
                    .post(validate_parameters)
                    .fallback(method_not_allowed),
            )
            .fallback(not_found)
            .with_state(state);

        let router = if self.root.is_empty() {
            api
        } else {
            Router::new().nest(&self.root, api).fallback(not_found)
        };
        router.layer(TraceLayer::new_for_http())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    engine: ExecutionEngine,
    processors: Vec<Arc<dyn Processor>>,
    pipeline: Option<PipelineExecutor>,
    api_prefix: String,
}

impl AppState {
    fn find(&self, namespace: &str, name: &str) -> Result<&Arc<dyn Processor>, ServerError> {
        self.inner
            .processors
            .iter()
            .find(|p| {
                let d = p.descriptor();
                d.namespace().as_str().eq_ignore_ascii_case(namespace)
                    && d.name().as_str().eq_ignore_ascii_case(name)
            })
            .ok_or(ServerError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

async fn read_request(
    request: Request,
    capability: Option<&pipeline::CapabilityDeclaration>,
) -> Result<WireRequest, ServerError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let charset = wire::check_request_content_type(content_type.as_deref())?;
    let multipart = Multipart::from_request(request, &()).await?;
    let parts = wire::read_parts(multipart).await?;
    wire::decode_request(&parts, charset, capability)
}

async fn execute_processor(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ServerError> {
    let processor = state.find(&namespace, &name)?;
    let descriptor = processor.descriptor();
    let request = read_request(request, Some(descriptor.capability())).await?;

    let permissions = request.parameters.clone().unwrap_or_default().permissions();
    let parameters = request.processor_parameters();
    descriptor
        .parameters()
        .validate(&parameters)
        .map_err(|messages| invalid_parameters(request.parameters_field(), messages))?;
    let engine = &state.inner.engine;
    tracing::debug!(
        processor = %descriptor.id(),
        stage = %request.stage(),
        ?permissions,
        parameters = parameters.len(),
        "executing processor"
    );

    let inbound = Inbound::new(request.stage(), request.metadata());
    let result = engine
        .execute_with_parameters(
            &request.envelope,
            processor.as_ref(),
            engine.config().budget,
            permissions,
            parameters,
        )
        .await;
    let result = compose(PipelineState::new(request.envelope), result).into_result();
    multipart::render(result, Origin::Processor(descriptor), &inbound)
}

fn invalid_parameters(field: &str, messages: Vec<String>) -> ServerError {
    ServerError::FieldParse {
        field: field.to_string(),
        detail: "invalid parameters".to_string(),
        messages,
    }
}

/// Every key must be declared by at least one stage, and each stage's share
/// must satisfy that stage's schema.
fn pipeline_parameter_errors(executor: &PipelineExecutor, parameters: &ParameterMap) -> Vec<String> {
    let mut errors: Vec<String> = parameters
        .keys()
        .filter(|name| {
            !executor.stages().iter().any(|stage| {
                let schema = stage.processor.descriptor().parameters();
                schema.fields().iter().any(|f| &f.name == *name)
            })
        })
        .map(|name| format!("unknown parameter '{name}'"))
        .collect();
    for stage in executor.stages() {
        let share = stage.parameters(parameters);
        if let Err(found) = stage.processor.descriptor().parameters().validate(&share) {
            let id = stage.processor.descriptor().id();
            errors.extend(found.into_iter().map(|e| format!("{id}: {e}")));
        }
    }
    errors
}

async fn execute_pipeline(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ServerError> {
    let executor = state.inner.pipeline.as_ref().ok_or(ServerError::NotFound)?;
    let request = read_request(request, None).await?;

    // Without a parameters part each stage keeps its configured permissions.
    let limit = request
        .parameters
        .as_ref()
        .map(WireParameters::permissions)
        .unwrap_or_default();
    let parameters = request.processor_parameters();
    let errors = pipeline_parameter_errors(executor, &parameters);
    if !errors.is_empty() {
        return Err(invalid_parameters(request.parameters_field(), errors));
    }
    let inbound = Inbound::new(request.stage(), request.metadata());
    let result = executor
        .run_within(
            request.envelope,
            executor.engine().config().budget,
            limit,
            &parameters,
        )
        .await;

    let ids: Vec<ProcessorId> = executor
        .stages()
        .iter()
        .map(|stage| stage.processor.descriptor().id())
        .collect();
    multipart::render(result, Origin::Pipeline(&ids), &inbound)
}

async fn head_processor(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    state.find(&namespace, &name)?;
    Ok(StatusCode::OK)
}

async fn head_pipeline(State(state): State<AppState>) -> Result<StatusCode, ServerError> {
    state.inner.pipeline.as_ref().ok_or(ServerError::NotFound)?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// JSON Schema of the permission flags every processor accepts.
pub fn parameters_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "annotate": {"type": "boolean", "default": true},
            "modify": {"type": "boolean", "default": false},
            "reject": {"type": "boolean", "default": false},
        },
        "additionalProperties": true,
    })
}

/// The permission flags plus whatever `descriptor` declares. Undeclared
/// keys are refused.
fn processor_parameters_schema(descriptor: &ProcessorDescriptor) -> Value {
    let mut schema = parameters_schema();
    if let Some(properties) = schema["properties"].as_object_mut() {
        properties.extend(descriptor.parameters().to_json_properties());
    }
    schema["additionalProperties"] = json!(false);
    schema
}

fn signature_document(descriptor: &ProcessorDescriptor) -> Value {
    json!({
        "fields": descriptor.capability().signature(),
        "parameters": processor_parameters_schema(descriptor),
    })
}

async fn signature(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, ServerError> {
    let processor = state.find(&namespace, &name)?;
    Ok(Json(signature_document(processor.descriptor())))
}

async fn validate_parameters(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let processor = state.find(&namespace, &name)?;
    let text = String::from_utf8_lossy(&body);
    let errors = match WireParameters::parse(&text) {
        Ok(parameters) => match processor.descriptor().parameters().validate(&parameters.extra) {
            Ok(()) => Vec::new(),
            Err(errors) => errors,
        },
        Err(errors) => errors,
    };

    let valid = errors.is_empty();
    let mut document = signature_document(processor.descriptor());
    document["validation"] = json!({"valid": valid, "errors": errors});
    let status = if valid {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(document)).into_response())
}

// ---------------------------------------------------------------------------
// Info
// ---------------------------------------------------------------------------

async fn redirect_to_info(State(state): State<AppState>) -> Redirect {
    Redirect::temporary(&format!("{}/info", state.inner.api_prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InfoFormat {
    Json,
    Text,
    Markdown,
}

fn negotiate(headers: &HeaderMap) -> InfoFormat {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept.contains("text/markdown") {
        InfoFormat::Markdown
    } else if accept.contains("text/plain") {
        InfoFormat::Text
    } else {
        InfoFormat::Json
    }
}

async fn info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let prefix = &state.inner.api_prefix;
    let processors = &state.inner.processors;
    match negotiate(&headers) {
        InfoFormat::Json => Json(info_json(prefix, processors, state.inner.pipeline.as_ref()))
            .into_response(),
        InfoFormat::Text => {
            let mut body: String = processors
                .iter()
                .map(|p| format!("{prefix}{}\n", p.descriptor().execute_path()))
                .collect();
            if state.inner.pipeline.is_some() {
                body.push_str(&format!("{prefix}/execute\n"));
            }
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        InfoFormat::Markdown => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            info_markdown(prefix, processors),
        )
            .into_response(),
    }
}

fn info_json(
    prefix: &str,
    processors: &[Arc<dyn Processor>],
    pipeline: Option<&PipelineExecutor>,
) -> Value {
    let listed: Vec<Value> = processors
        .iter()
        .map(|p| {
            let d = p.descriptor();
            let mut entry = json!({
                "name": d.name().as_str(),
                "namespace": d.namespace().as_str(),
                "id": d.id().to_string(),
                "available_versions": [d.version().as_str()],
                "latest_version": d.version().as_str(),
                "execute_path": format!("{prefix}{}", d.execute_path()),
                "signature_path": format!("{prefix}{}", d.signature_path()),
            });
            if let Some(description) = d.description() {
                entry["description"] = json!(description);
            }
            entry
        })
        .collect();

    let mut document = json!({
        "api_versions": [API_VERSION],
        "processors": listed,
    });
    if let Some(executor) = pipeline {
        let stages: Vec<String> = executor
            .stages()
            .iter()
            .map(|s| s.processor.descriptor().id().to_string())
            .collect();
        document["pipeline"] = json!({
            "execute_path": format!("{prefix}/execute"),
            "stages": stages,
        });
    }
    document
}

fn info_markdown(prefix: &str, processors: &[Arc<dyn Processor>]) -> String {
    let mut out = String::from("# Processors\n\n");
    for p in processors {
        let id = p.descriptor().id().to_string();
        out.push_str(&format!("- [{id}](#{})\n", id.replace(':', "-").to_lowercase()));
    }

    for p in processors {
        let d = p.descriptor();
        let consumes: &BTreeSet<ItemKind> = d.capability().consumes();
        out.push_str(&format!("\n## {}\n\n", d.id()));
        if let Some(description) = d.description() {
            out.push_str(&format!("{description}\n\n"));
        }
        out.push_str(&format!("- Version: {}\n", d.version()));
        out.push_str(&format!("- Execute: `{prefix}{}`\n", d.execute_path()));
        out.push_str(&format!("- Signature: `{prefix}{}`\n\n", d.signature_path()));
        out.push_str("| Direction | Supported |\n|-----------|-----------|\n");
        for kind in [ItemKind::Prompt, ItemKind::Response, ItemKind::Embedding] {
            let supported = if consumes.contains(&kind) { "yes" } else { "no" };
            out.push_str(&format!("| {kind} | {supported} |\n"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Fallbacks
// ---------------------------------------------------------------------------

async fn not_found() -> ServerError {
    ServerError::NotFound
}

async fn method_not_allowed() -> ServerError {
    ServerError::MethodNotAllowed
}
