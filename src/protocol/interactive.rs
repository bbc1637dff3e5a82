//! # Interactive Codec
//!
//! Wire format of the WebSocket streaming endpoint: textual JSON event
//! frames from server to client, framed binary audio from client to server.
//!
//! ## Binary Frame Layout (client → server):
//! - byte 0: transport handler tag (stripped, not part of the PCM data)
//! - bytes 1..: 16-bit little-endian PCM samples
//! - a frame of length exactly 1 is the end-of-stream sentinel
//! - an empty frame is malformed
//!
//! ## JSON Event Frames (server → client):
//! `run-start`, `stt-start`, `stt-vad-start`, `stt-vad-end`, `stt-end`
//! (carrying `stt_output`), `error`, `run-end`.

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{InboundEvent, SessionEvent};
use serde::{Deserialize, Serialize};

/// Transcript payload carried by the `stt-end` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttOutput {
    pub text: String,
    pub language: String,
}

/// JSON event frames sent to interactive clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InteractiveFrame {
    #[serde(rename = "run-start")]
    RunStart { session_id: String },

    #[serde(rename = "stt-start")]
    SttStart,

    #[serde(rename = "stt-vad-start")]
    SttVadStart,

    #[serde(rename = "stt-vad-end")]
    SttVadEnd,

    #[serde(rename = "stt-end")]
    SttEnd { stt_output: SttOutput },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "run-end")]
    RunEnd,
}

/// Decode one binary WebSocket frame into an abstract inbound event.
pub fn decode_binary_frame(frame: &[u8]) -> GatewayResult<InboundEvent> {
    match frame.len() {
        0 => Err(GatewayError::BadRequest(
            "empty binary frame".to_string(),
        )),
        1 => Ok(InboundEvent::EndOfStream),
        _ => Ok(InboundEvent::Audio(frame[1..].to_vec())),
    }
}

/// Encode a session event as its interactive wire frame.
///
/// Every abstract event has an interactive representation.
pub fn encode_event(event: &SessionEvent) -> InteractiveFrame {
    match event {
        SessionEvent::SessionStarted { session_id } => InteractiveFrame::RunStart {
            session_id: session_id.clone(),
        },
        SessionEvent::RecognitionStarted => InteractiveFrame::SttStart,
        SessionEvent::VadStarted => InteractiveFrame::SttVadStart,
        SessionEvent::VadEnded => InteractiveFrame::SttVadEnd,
        SessionEvent::Result(result) => InteractiveFrame::SttEnd {
            stt_output: SttOutput {
                text: result.text.clone(),
                language: result.language.clone(),
            },
        },
        SessionEvent::Error { code, message } => InteractiveFrame::Error {
            code: code.clone(),
            message: message.clone(),
        },
        SessionEvent::SessionEnded => InteractiveFrame::RunEnd,
    }
}

/// Encode a session event straight to its JSON text.
pub fn encode_event_json(event: &SessionEvent) -> String {
    // The frame enum contains nothing unserializable.
    serde_json::to_string(&encode_event(event)).unwrap_or_else(|_| {
        r#"{"type":"error","code":"internal-error","message":"event encoding failed"}"#.to_string()
    })
}
