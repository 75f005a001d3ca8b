//! Request side of the wire protocol: content types, charsets, per-request
//! parameters, and multipart decoding into an [`InputEnvelope`].
//!
//! ## Parts
//!
//! | Part | Content | Required |
//! |------|---------|----------|
//! | `metadata` | JSON object | always |
//! | `input.messages` | `{"messages": [...]}` or `text/plain` | prompt stage |
//! | `response.choices` | `{"choices": [...]}` or `text/plain` | response stage |
//! | `input.embeddings` | `{"vectors": [[...]]}` | embedding stage |
//! | `input.parameters` | JSON object | no; prompt and embedding stages only |
//! | `response.parameters` | JSON object | no; response stage only |
//!
//! A request is a response-stage request iff `response.choices` is present.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::Multipart;
use pipeline::{
    CapabilityDeclaration, Completion, EmbeddingSet, InputEnvelope, ItemKind, Metadata,
    ParameterMap, Payload, Permissions, Prompt,
};
use serde::{Deserialize, Serialize};

use crate::ServerError;

pub const METADATA_FIELD: &str = "metadata";
pub const INPUT_FIELD: &str = "input.messages";
pub const RESPONSE_FIELD: &str = "response.choices";
pub const EMBEDDINGS_FIELD: &str = "input.embeddings";
pub const INPUT_PARAMETERS_FIELD: &str = "input.parameters";
pub const RESPONSE_PARAMETERS_FIELD: &str = "response.parameters";
pub const REJECT_FIELD: &str = "reject";

const KNOWN_FIELDS: [&str; 6] = [
    METADATA_FIELD,
    INPUT_FIELD,
    RESPONSE_FIELD,
    EMBEDDINGS_FIELD,
    INPUT_PARAMETERS_FIELD,
    RESPONSE_PARAMETERS_FIELD,
];

// ---------------------------------------------------------------------------
// Content-Type
// ---------------------------------------------------------------------------

/// A parsed `Content-Type` value: lower-cased media type plus parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: String,
    params: BTreeMap<String, String>,
}

impl ContentType {
    /// Parses `type/subtype; key=value; key="quoted"`. Parameter names are
    /// lower-cased; values keep their case.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut pieces = raw.split(';');
        let media_type = pieces.next()?.trim().to_ascii_lowercase();
        if media_type.is_empty() {
            return None;
        }
        let params = pieces
            .filter_map(|piece| {
                let (key, value) = piece.split_once('=')?;
                let value = value.trim().trim_matches('"');
                Some((key.trim().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        Some(Self { media_type, params })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_plain_text(&self) -> bool {
        self.media_type == "text/plain"
    }
}

/// Validates the request `Content-Type` header and returns the charset that
/// parts fall back to.
pub fn check_request_content_type(raw: Option<&str>) -> Result<Charset, ServerError> {
    let raw = raw.ok_or_else(|| ServerError::UnsupportedMediaType {
        detail: "Content-Type header missing".to_string(),
    })?;
    let content_type = ContentType::parse(raw).ok_or_else(|| ServerError::UnsupportedMediaType {
        detail: "Content-Type header is empty".to_string(),
    })?;
    if content_type.media_type != "multipart/form-data" {
        return Err(ServerError::UnsupportedMediaType {
            detail: "Content-Type header mismatch - expecting: multipart/form-data".to_string(),
        });
    }
    if content_type.param("boundary").map_or(true, str::is_empty) {
        return Err(ServerError::UnsupportedMediaType {
            detail: "Content-Type header missing boundary".to_string(),
        });
    }
    content_type
        .param("charset")
        .map_or(Ok(Charset::Utf8), Charset::from_label)
}

// ---------------------------------------------------------------------------
// Charsets
// ---------------------------------------------------------------------------

/// Text encodings accepted for request parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    UsAscii,
    Latin1,
}

impl Charset {
    /// Accepts `utf-8`, `us-ascii`, `latin-1`, and `iso-8859-1`, any case.
    pub fn from_label(label: &str) -> Result<Self, ServerError> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" => Ok(Charset::Utf8),
            "us-ascii" => Ok(Charset::UsAscii),
            "latin-1" | "iso-8859-1" => Ok(Charset::Latin1),
            other => Err(ServerError::UnsupportedEncoding {
                charset: other.to_string(),
            }),
        }
    }

    pub fn decode(self, field: &str, bytes: &[u8]) -> Result<String, ServerError> {
        let parse_error = |detail: String| ServerError::FieldParse {
            field: field.to_string(),
            detail,
            messages: Vec::new(),
        };
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| parse_error(format!("invalid utf-8: {e}"))),
            Charset::UsAscii => {
                if let Some(pos) = bytes.iter().position(|b| !b.is_ascii()) {
                    return Err(parse_error(format!("non-ascii byte at offset {pos}")));
                }
                Ok(bytes.iter().map(|&b| char::from(b)).collect())
            }
            Charset::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Per-request parameters sent in `input.parameters` / `response.parameters`.
///
/// `annotate` defaults to true; `modify` and `reject` default to false and
/// may not both be true. Other keys are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireParameters {
    #[serde(default = "default_true")]
    pub annotate: bool,
    #[serde(default)]
    pub modify: bool,
    #[serde(default)]
    pub reject: bool,
    #[serde(flatten)]
    pub extra: ParameterMap,
}

impl Default for WireParameters {
    fn default() -> Self {
        Self {
            annotate: true,
            modify: false,
            reject: false,
            extra: ParameterMap::new(),
        }
    }
}

impl WireParameters {
    /// Parses and validates a parameters document, returning every problem
    /// found.
    pub fn parse(text: &str) -> Result<Self, Vec<String>> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| vec![e.to_string()])?;
        if !value.is_object() {
            return Err(vec!["parameters must be a JSON object".to_string()]);
        }
        let mut errors = Vec::new();
        for flag in ["annotate", "modify", "reject"] {
            if let Some(v) = value.get(flag) {
                if !v.is_boolean() {
                    errors.push(format!("{flag}: expected a boolean, got {v}"));
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let parameters: Self = serde_json::from_value(value).map_err(|e| vec![e.to_string()])?;
        if parameters.modify && parameters.reject {
            return Err(vec![
                "Modify and Reject modes are mutually exclusive".to_string()
            ]);
        }
        Ok(parameters)
    }

    pub fn permissions(&self) -> Permissions {
        Permissions {
            annotate: self.annotate,
            modify: self.modify,
            reject: self.reject,
        }
    }
}

// ---------------------------------------------------------------------------
// Multipart decoding
// ---------------------------------------------------------------------------

/// One part as received, before decoding.
#[derive(Debug, Clone)]
pub struct RawPart {
    pub content_type: Option<ContentType>,
    pub body: Bytes,
}

/// Reads every part of a multipart body.
///
/// Unknown parts are skipped. A known part sent twice is refused.
pub async fn read_parts(mut multipart: Multipart) -> Result<BTreeMap<String, RawPart>, ServerError> {
    let mut parts = BTreeMap::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if !KNOWN_FIELDS.contains(&name.as_str()) {
            tracing::debug!(field = %name, "ignoring unknown multipart field");
            continue;
        }
        let content_type = field.content_type().and_then(ContentType::parse);
        let body = field.bytes().await?;
        if parts.contains_key(&name) {
            return Err(ServerError::InvalidFields {
                detail: format!("field {name} was sent more than once"),
            });
        }
        parts.insert(name, RawPart { content_type, body });
    }
    Ok(parts)
}

/// A decoded execute request.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub envelope: InputEnvelope,
    /// `None` when the request carried no parameters part.
    pub parameters: Option<WireParameters>,
}

impl WireRequest {
    pub fn stage(&self) -> ItemKind {
        self.envelope.item_kind()
    }

    /// Inbound metadata, echoed back in part for correlation.
    pub fn metadata(&self) -> &Metadata {
        self.envelope.metadata()
    }

    /// Name of the part that carries parameters for this stage.
    pub fn parameters_field(&self) -> &'static str {
        match self.stage() {
            ItemKind::Response => RESPONSE_PARAMETERS_FIELD,
            _ => INPUT_PARAMETERS_FIELD,
        }
    }

    /// Parameters meant for processors: everything except the permission
    /// flags.
    pub fn processor_parameters(&self) -> ParameterMap {
        self.parameters
            .as_ref()
            .map(|p| p.extra.clone())
            .unwrap_or_default()
    }
}

/// Decodes parts into an envelope.
///
/// When `capability` is given, the request stage must be one the processor
/// consumes.
pub fn decode_request(
    parts: &BTreeMap<String, RawPart>,
    fallback: Charset,
    capability: Option<&CapabilityDeclaration>,
) -> Result<WireRequest, ServerError> {
    if !parts.contains_key(METADATA_FIELD) {
        return Err(ServerError::MissingField {
            field: METADATA_FIELD,
        });
    }

    let stage = if parts.contains_key(RESPONSE_FIELD) {
        ItemKind::Response
    } else if parts.contains_key(INPUT_FIELD) {
        ItemKind::Prompt
    } else if parts.contains_key(EMBEDDINGS_FIELD) {
        ItemKind::Embedding
    } else {
        return Err(ServerError::MissingPromptAndResponse);
    };

    if let Some(capability) = capability {
        if !capability.can_consume(stage) {
            return Err(ServerError::InvalidFields {
                detail: format!("Processor signature does not allow {stage} fields"),
            });
        }
    }

    let parameters_field = match stage {
        ItemKind::Response if parts.contains_key(INPUT_PARAMETERS_FIELD) => {
            return Err(ServerError::InvalidFields {
                detail: format!("prompt parameters cannot be present with {RESPONSE_FIELD} field"),
            });
        }
        ItemKind::Response => RESPONSE_PARAMETERS_FIELD,
        _ if parts.contains_key(RESPONSE_PARAMETERS_FIELD) => {
            return Err(ServerError::InvalidFields {
                detail: format!(
                    "response parameters cannot be present without a {RESPONSE_FIELD} field"
                ),
            });
        }
        _ => INPUT_PARAMETERS_FIELD,
    };

    let parameters = match parts.get(parameters_field) {
        Some(part) => {
            let text = text_of(parameters_field, part, fallback)?;
            Some(
                WireParameters::parse(&text).map_err(|messages| ServerError::FieldParse {
                    field: parameters_field.to_string(),
                    detail: "invalid parameters".to_string(),
                    messages,
                })?,
            )
        }
        None => None,
    };

    let metadata = decode_metadata(parts, fallback)?;
    let prompt = parts
        .get(INPUT_FIELD)
        .map(|part| decode_prompt(part, fallback))
        .transpose()?;

    let envelope = match stage {
        ItemKind::Response => {
            let part = parts.get(RESPONSE_FIELD).ok_or(ServerError::MissingPromptAndResponse)?;
            let envelope = InputEnvelope::new(decode_completion(part, fallback)?);
            match prompt {
                Some(prompt) => envelope.with_prompt_context(prompt),
                None => envelope,
            }
        }
        ItemKind::Prompt => {
            let prompt = prompt.ok_or(ServerError::MissingPromptAndResponse)?;
            InputEnvelope::new(prompt)
        }
        _ => {
            let part = parts
                .get(EMBEDDINGS_FIELD)
                .ok_or(ServerError::MissingPromptAndResponse)?;
            let text = text_of(EMBEDDINGS_FIELD, part, fallback)?;
            let set: EmbeddingSet = parse_json(EMBEDDINGS_FIELD, &text)?;
            InputEnvelope::new(Payload::Embedding(set))
        }
    };

    Ok(WireRequest {
        envelope: envelope.with_metadata(metadata),
        parameters,
    })
}

fn text_of(field: &str, part: &RawPart, fallback: Charset) -> Result<String, ServerError> {
    let charset = match part.content_type.as_ref().and_then(|c| c.param("charset")) {
        Some(label) => Charset::from_label(label)?,
        None => fallback,
    };
    charset.decode(field, &part.body)
}

fn parse_json<T: serde::de::DeserializeOwned>(field: &str, text: &str) -> Result<T, ServerError> {
    serde_json::from_str(text).map_err(|e| ServerError::FieldParse {
        field: field.to_string(),
        detail: e.to_string(),
        messages: Vec::new(),
    })
}

fn decode_metadata(
    parts: &BTreeMap<String, RawPart>,
    fallback: Charset,
) -> Result<Metadata, ServerError> {
    let part = parts.get(METADATA_FIELD).ok_or(ServerError::MissingField {
        field: METADATA_FIELD,
    })?;
    let text = text_of(METADATA_FIELD, part, fallback)?;
    match parse_json::<serde_json::Value>(METADATA_FIELD, &text)? {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(ServerError::FieldParse {
            field: METADATA_FIELD.to_string(),
            detail: "metadata must be a JSON object".to_string(),
            messages: Vec::new(),
        }),
    }
}

fn decode_prompt(part: &RawPart, fallback: Charset) -> Result<Prompt, ServerError> {
    let text = text_of(INPUT_FIELD, part, fallback)?;
    if part.content_type.as_ref().is_some_and(ContentType::is_plain_text) {
        return Ok(Prompt::from_text(text));
    }
    parse_json(INPUT_FIELD, &text)
}

fn decode_completion(part: &RawPart, fallback: Charset) -> Result<Completion, ServerError> {
    let text = text_of(RESPONSE_FIELD, part, fallback)?;
    if part.content_type.as_ref().is_some_and(ContentType::is_plain_text) {
        return Ok(Completion::from_text(text));
    }
    parse_json(RESPONSE_FIELD, &text)
}
