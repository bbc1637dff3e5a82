//! # Wire Protocols
//!
//! Two independent wire encodings share one abstract event vocabulary. Each
//! codec decodes its transport's frames into [`InboundEvent`]s for the
//! session controller and encodes the controller's [`SessionEvent`]s back
//! into its own wire form. The controller never sees wire bytes and cannot
//! tell which codec is driving it.
//!
//! - [`interactive`]: WebSocket JSON event frames + tag-prefixed binary audio
//! - [`wyoming`]: length-framed binary device protocol with capability
//!   negotiation

use crate::transcription::TranscriptionResult;

pub mod interactive;
pub mod wyoming;

/// Events flowing from a client into a session, after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Session parameter overrides, delivered before (or between) audio.
    Begin {
        language: Option<String>,
        model: Option<String>,
    },
    /// One PCM chunk with all transport framing already stripped.
    Audio(Vec<u8>),
    /// The client finished sending audio.
    EndOfStream,
}

/// Events a session emits toward its client, before encoding.
///
/// Matched exhaustively by both codecs; adding a variant is a compile-time
/// change at every encode site.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted { session_id: String },
    RecognitionStarted,
    VadStarted,
    VadEnded,
    Result(TranscriptionResult),
    Error { code: String, message: String },
    SessionEnded,
}

impl SessionEvent {
    /// Build an error event from a gateway error.
    pub fn error(err: &crate::error::GatewayError) -> Self {
        SessionEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
