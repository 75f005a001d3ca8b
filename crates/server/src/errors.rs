//! HTTP-facing errors.
//!
//! Every request-level failure maps to a JSON body of the form
//! `{"detail": "...", "messages": [...]}` (`messages` only when there is more
//! than a single cause) with the status code listed on each variant.
//! Processor faults surfaced by the engine use `{"detail", "fault"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pipeline::{ExecutionFault, FaultKind};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Content-Type missing, not `multipart/form-data`, or without a boundary.
    /// 415.
    #[error("{detail}")]
    UnsupportedMediaType { detail: String },

    /// A required multipart part is absent. 400.
    #[error("Missing required multipart field: {field}")]
    MissingField { field: &'static str },

    /// Neither a prompt nor a response part was sent. 400.
    #[error("Request must contain either a prompt or a response")]
    MissingPromptAndResponse,

    /// The combination of parts is not acceptable for this processor. 400.
    #[error("{detail}")]
    InvalidFields { detail: String },

    /// A part could not be decoded or parsed. 400.
    #[error("Unable to parse field [{field}]: {detail}")]
    FieldParse {
        field: String,
        detail: String,
        messages: Vec<String>,
    },

    /// A part or the request declared a charset outside the allowed set. 400.
    #[error("Unsupported text encoding: {charset}")]
    UnsupportedEncoding { charset: String },

    /// The multipart body itself was malformed. 400.
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    /// The request could not be read as multipart at all. 400.
    #[error("Unreadable multipart request: {0}")]
    MultipartRequest(#[from] axum::extract::multipart::MultipartRejection),

    /// No processor is registered at the requested path. 404.
    #[error("Not found")]
    NotFound,

    /// The route exists but not for this method. 405.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// The processor malfunctioned. 504 for timeouts, 500 otherwise.
    #[error("Processor execution failed: {}", .0.detail)]
    Execution(ExecutionFault),

    /// The response could not be encoded. 500.
    #[error("Unable to encode response: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ServerError::MissingField { .. }
            | ServerError::MissingPromptAndResponse
            | ServerError::InvalidFields { .. }
            | ServerError::FieldParse { .. }
            | ServerError::UnsupportedEncoding { .. }
            | ServerError::Multipart(_)
            | ServerError::MultipartRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound => StatusCode::NOT_FOUND,
            ServerError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::Execution(fault) if fault.kind == FaultKind::Timeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ServerError::Execution(_) | ServerError::Encoding(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<FaultKind>,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request refused");
        }

        let body = match &self {
            ServerError::FieldParse { messages, .. } if !messages.is_empty() => ErrorBody {
                detail: self.to_string(),
                messages: Some(messages.as_slice()),
                fault: None,
            },
            ServerError::Execution(fault) => ErrorBody {
                detail: fault.detail.clone(),
                messages: None,
                fault: Some(fault.kind),
            },
            _ => ErrorBody {
                detail: self.to_string(),
                messages: None,
                fault: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
