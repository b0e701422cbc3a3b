//! # Error Handling
//!
//! Error types for the capture pipeline, the wire transport and the ingestion
//! server, plus the conversion of HTTP-facing errors into JSON responses.
//!
//! ## Error Categories:
//! - **LayoutError**: the capture bit-layout cannot be extracted. Fatal to the
//!   stream, never retried.
//! - **TransportError**: handshake / scheme / link failures. Fatal to the
//!   current connection attempt; the capture supervisor owns the retry policy.
//! - **ControlError**: a text frame that is not a valid control message. Logged
//!   and ignored, the connection continues.
//! - **TranscriptionError**: the speech-to-text backend is missing or failed.
//!   Soft failure, the session proceeds with an empty result.
//! - **SinkError**: a WAV file could not be created or written. The session
//!   keeps ingesting without that sink.
//! - **AppError**: errors surfaced over HTTP before an upgrade. A wrong audio
//!   path is not one of them: it is upgraded and closed with code 1008.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::audio::extract::{ByteOrder, Justification};

/// The configured capture layout is not one of the supported extraction modes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("unsupported capture layout: {container_bits}-bit {byte_order:?} / {justification:?}")]
    UnsupportedLayout {
        container_bits: u8,
        byte_order: ByteOrder,
        justification: Justification,
    },

    #[error("output buffer holds {capacity} samples, input carries {needed}")]
    OutputTooSmall { capacity: usize, needed: usize },
}

/// Failures of the minimal WebSocket client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Anything other than `ws://` is rejected before a socket is opened.
    #[error("unsupported url scheme '{0}' (only ws:// is supported)")]
    UnsupportedScheme(String),

    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),

    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// Network association or the peer went away mid-stream.
    #[error("link down: {0}")]
    LinkDown(String),

    #[error("websocket protocol error: {0}")]
    Protocol(String),

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A text frame could not be decoded as a [`ControlMessage`](crate::wire::ControlMessage).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription unavailable: {0}")]
    Unavailable(String),

    #[error("transcription failed: {0}")]
    Failed(String),
}

/// Failures of the WAV sinks on the server.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot create audio file {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: hound::Error,
    },

    #[error("audio file write failed: {0}")]
    Write(#[from] hound::Error),

    #[error("output directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can end one capture-transmit cycle.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("capture device error: {0}")]
    Device(std::io::Error),

    #[error("control message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned from HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500
/// - NotFound → 404
/// - ServiceUnavailable → 503
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (sink creation failures, task panics, etc.)
    Internal(String),

    /// Requested resource was not found
    NotFound(String),

    /// Session limit reached
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<SinkError> for AppError {
    fn from(err: SinkError) -> Self {
        AppError::Internal(err.to_string())
    }
}
