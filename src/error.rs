//! # Error Handling
//!
//! Defines the gateway-wide error taxonomy and how each kind maps onto an
//! HTTP response. Every fallible operation in the crate returns
//! `Result<T, GatewayError>`; recovery happens at the session-controller or
//! HTTP-handler boundary, never deeper in the pipeline.
//!
//! ## Error Categories:
//! - **ResourceExhausted**: admission rejected (memory or concurrency cap) → 503
//! - **UnsupportedAudioFormat**: the normalizer rejected the container/codec → 400
//! - **TranscriptionFailure**: one utterance failed in the engine → 500, session survives
//! - **NoSpeechDetected**: a stream ended without any non-empty transcript
//! - **ClientDisconnected**: transport dropped mid-session; logged, not surfaced
//! - **ModelLoadFailure**: a model swap failed; fatal only at startup
//! - **BadRequest / Internal**: ambient HTTP-edge failures

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Why the admission controller refused a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Process resident memory is above the configured cap.
    Overloaded,
    /// The concurrent-session cap is already reached.
    TooManyRequests,
}

impl RejectReason {
    /// Stable wire code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Overloaded => "overloaded",
            RejectReason::TooManyRequests => "too-many-requests",
        }
    }
}

/// Gateway error taxonomy.
///
/// ## Fatality:
/// Only `ClientDisconnected` and `Internal` tear a streaming session down;
/// everything else is reported to the client and the session continues
/// (or, for single-shot HTTP, becomes the response).
#[derive(Debug)]
pub enum GatewayError {
    /// Admission rejected before any buffering work began.
    ResourceExhausted(RejectReason),

    /// The audio normalizer could not decode the input.
    UnsupportedAudioFormat(String),

    /// The inference engine failed for a single utterance.
    TranscriptionFailure(String),

    /// The stream ended without ever producing non-empty text.
    NoSpeechDetected,

    /// The transport went away mid-session.
    ClientDisconnected,

    /// A model load/swap failed; the previous model is untouched.
    ModelLoadFailure(String),

    /// Client sent invalid or malformed data.
    BadRequest(String),

    /// Server-side failures (I/O, missing external tools, etc.).
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code carried on every outward-facing error.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ResourceExhausted(reason) => reason.code(),
            GatewayError::UnsupportedAudioFormat(_) => "unsupported-audio-format",
            GatewayError::TranscriptionFailure(_) => "transcription-failed",
            GatewayError::NoSpeechDetected => "no-speech-detected",
            GatewayError::ClientDisconnected => "client-disconnected",
            GatewayError::ModelLoadFailure(_) => "model-load-failed",
            GatewayError::BadRequest(_) => "bad-request",
            GatewayError::Internal(_) => "internal-error",
        }
    }

    /// Whether a streaming session must be torn down when this surfaces.
    ///
    /// Per-utterance failures are reported as protocol error events and the
    /// session keeps buffering; transport-level failures are terminal.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            GatewayError::ClientDisconnected | GatewayError::Internal(_)
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::ResourceExhausted(RejectReason::Overloaded) => {
                write!(f, "Server is overloaded")
            }
            GatewayError::ResourceExhausted(RejectReason::TooManyRequests) => {
                write!(f, "Too many concurrent requests")
            }
            GatewayError::UnsupportedAudioFormat(msg) => {
                write!(f, "Audio format not supported: {}", msg)
            }
            GatewayError::TranscriptionFailure(msg) => write!(f, "Transcription failed: {}", msg),
            GatewayError::NoSpeechDetected => write!(f, "No speech detected"),
            GatewayError::ClientDisconnected => write!(f, "Client disconnected"),
            GatewayError::ModelLoadFailure(msg) => write!(f, "Model load failed: {}", msg),
            GatewayError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            GatewayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Converts gateway errors into the JSON error envelope used by every HTTP
/// endpoint.
///
/// ## HTTP Status Code Mapping:
/// - ResourceExhausted → 503 (Service Unavailable)
/// - UnsupportedAudioFormat / BadRequest → 400 (Bad Request)
/// - everything else → 500 (Internal Server Error)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "code": "too-many-requests",
///     "message": "Too many concurrent requests",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for GatewayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            GatewayError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UnsupportedAudioFormat(_) | GatewayError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Shorthand for results carrying the gateway error type.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(
            GatewayError::ResourceExhausted(RejectReason::Overloaded).code(),
            "overloaded"
        );
        assert_eq!(
            GatewayError::ResourceExhausted(RejectReason::TooManyRequests).code(),
            "too-many-requests"
        );
        assert_eq!(
            GatewayError::UnsupportedAudioFormat("mp9".into()).code(),
            "unsupported-audio-format"
        );
        assert_eq!(GatewayError::NoSpeechDetected.code(), "no-speech-detected");
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            GatewayError::ResourceExhausted(RejectReason::Overloaded).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UnsupportedAudioFormat("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::TranscriptionFailure("engine".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_session_fatality() {
        assert!(GatewayError::ClientDisconnected.is_fatal_for_session());
        assert!(!GatewayError::TranscriptionFailure("x".into()).is_fatal_for_session());
        assert!(!GatewayError::NoSpeechDetected.is_fatal_for_session());
    }
}
