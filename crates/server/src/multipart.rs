//! Response side of the wire protocol.
//!
//! A pipeline result becomes either `204 No Content` (nothing to report) or
//! a `multipart/form-data` body. Parts appear in a fixed order with
//! `metadata` last:
//!
//! | Order | Part | When |
//! |-------|------|------|
//! | 0 | `input.messages` / `response.choices` / `input.embeddings` | payload modified |
//! | 1 | `input.parameters` / `response.parameters` | model parameters modified |
//! | 2 | `reject` | traffic rejected |
//! | 3 | `metadata` | always |

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use pipeline::{
    ItemKind, Metadata, Outcome, Payload, PipelineResult, ProcessorDescriptor, ProcessorId,
    RequestId, StepId,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::wire::{
    EMBEDDINGS_FIELD, INPUT_FIELD, INPUT_PARAMETERS_FIELD, METADATA_FIELD, REJECT_FIELD,
    RESPONSE_FIELD, RESPONSE_PARAMETERS_FIELD,
};
use crate::ServerError;

const REQUEST_ID_KEY: &str = "request_id";
const STEP_ID_KEY: &str = "step_id";

/// What the response needs to know about the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Stage of the request; picks the parameters part name.
    pub stage: ItemKind,
    pub request_id: Option<RequestId>,
    pub step_id: Option<StepId>,
}

impl Inbound {
    /// Reads the gateway's correlation ids from inbound metadata. Values
    /// that are not non-empty strings are not echoed.
    pub fn new(stage: ItemKind, metadata: &Metadata) -> Self {
        let text = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            stage,
            request_id: text(REQUEST_ID_KEY).and_then(RequestId::new),
            step_id: text(STEP_ID_KEY).and_then(StepId::new),
        }
    }
}

/// Who produced the result being rendered.
#[derive(Debug, Clone, Copy)]
pub enum Origin<'a> {
    /// A single processor route.
    Processor(&'a ProcessorDescriptor),
    /// The pipeline route; lists the stages in order.
    Pipeline(&'a [ProcessorId]),
}

#[derive(Serialize)]
struct RejectBody<'a> {
    code: pipeline::RejectCode,
    detail: &'a str,
}

/// One outgoing part.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: &'static str,
    pub body: String,
}

fn field_order(name: &str) -> u8 {
    match name {
        INPUT_PARAMETERS_FIELD | RESPONSE_PARAMETERS_FIELD => 1,
        REJECT_FIELD => 2,
        METADATA_FIELD => 3,
        _ => 0,
    }
}

fn payload_field(kind: ItemKind, stage: ItemKind) -> &'static str {
    match kind {
        ItemKind::Prompt => INPUT_FIELD,
        ItemKind::Response => RESPONSE_FIELD,
        ItemKind::Embedding => EMBEDDINGS_FIELD,
        ItemKind::Parameters if stage == ItemKind::Response => RESPONSE_PARAMETERS_FIELD,
        ItemKind::Parameters => INPUT_PARAMETERS_FIELD,
    }
}

/// Renders a pipeline result as an HTTP response.
///
/// # Errors
///
/// `Error` outcomes become [`ServerError::Execution`].
pub fn render(
    result: PipelineResult,
    origin: Origin<'_>,
    inbound: &Inbound,
) -> Result<Response, ServerError> {
    let parts = match build_parts(result, origin, inbound)? {
        Some(parts) => parts,
        None => return Ok(StatusCode::NO_CONTENT.into_response()),
    };

    let boundary = new_boundary();
    let body = encode(&parts, &boundary);
    let content_type = format!("multipart/form-data;charset=utf-8;boundary=\"{boundary}\"");
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Builds the ordered parts for `result`, or `None` for an empty pass.
pub fn build_parts(
    result: PipelineResult,
    origin: Origin<'_>,
    inbound: &Inbound,
) -> Result<Option<Vec<Part>>, ServerError> {
    let PipelineResult {
        outcome,
        modifications,
        tags_added,
        metadata_added,
        ..
    } = result;

    let mut parts = Vec::new();
    match outcome {
        Outcome::Error(fault) => return Err(ServerError::Execution(fault)),
        Outcome::Pass if tags_added.is_empty() && metadata_added.is_empty() => return Ok(None),
        Outcome::Pass => {}
        Outcome::Modify(payload) => {
            let modified = if modifications.is_empty() {
                vec![payload]
            } else {
                modifications
            };
            for payload in &modified {
                parts.push(Part {
                    name: payload_field(payload.kind(), inbound.stage),
                    body: payload_json(payload)?,
                });
            }
        }
        Outcome::Reject(rejection) => parts.push(Part {
            name: REJECT_FIELD,
            body: serde_json::to_string(&RejectBody {
                code: rejection.code,
                detail: &rejection.reason,
            })?,
        }),
    }

    let mut metadata: Map<String, Value> = metadata_added.into_json();
    if !tags_added.is_empty() {
        metadata.insert("tags".to_string(), serde_json::to_value(&tags_added)?);
    }
    match origin {
        Origin::Processor(descriptor) => {
            metadata.insert("processor_id".to_string(), json!(descriptor.id().to_string()));
            metadata.insert(
                "processor_version".to_string(),
                json!(descriptor.version().as_str()),
            );
        }
        Origin::Pipeline(ids) => {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            metadata.insert("processors".to_string(), json!(ids));
        }
    }
    if let Some(id) = &inbound.request_id {
        metadata.insert(REQUEST_ID_KEY.to_string(), json!(id.as_str()));
    }
    if let Some(id) = &inbound.step_id {
        metadata.insert(STEP_ID_KEY.to_string(), json!(id.as_str()));
    }
    parts.push(Part {
        name: METADATA_FIELD,
        body: serde_json::to_string(&metadata)?,
    });

    parts.sort_by_key(|part| field_order(part.name));
    Ok(Some(parts))
}

fn payload_json(payload: &Payload) -> Result<String, serde_json::Error> {
    match payload {
        Payload::Prompt(prompt) => serde_json::to_string(prompt),
        Payload::Response(completion) => serde_json::to_string(completion),
        Payload::Embedding(set) => serde_json::to_string(set),
        Payload::Parameters(map) => serde_json::to_string(map),
    }
}

/// 64 hex characters.
fn new_boundary() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn encode(parts: &[Part], boundary: &str) -> String {
    let mut out = String::new();
    for part in parts {
        out.push_str(&format!("--{boundary}\r\n"));
        out.push_str(&format!(
            "Content-Disposition: form-data; name=\"{}\"\r\n",
            part.name
        ));
        out.push_str("Content-Type: application/json\r\n\r\n");
        out.push_str(&part.body);
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out
}
