//! HTTP surface for processors.
//!
//! ## Architectural Layer
//!
//! **Adapter.** Translates the gateway's multipart wire format into
//! [`pipeline::InputEnvelope`]s, hands them to the [`engine`], and renders the
//! composed result back onto the wire. No processing decisions are made here.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`wire`] | request parsing: content type, charsets, parts, parameters |
//! | [`multipart`] | response encoding |
//! | [`routes`] | axum router and handlers |
//! | [`errors`] | status codes and JSON error bodies |

pub mod errors;
pub mod multipart;
pub mod routes;
pub mod wire;

pub use errors::ServerError;
pub use routes::{parameters_schema, ProcessorRoutes, API_VERSION};
pub use wire::{Charset, ContentType, WireParameters, WireRequest};
