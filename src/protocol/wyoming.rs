//! # Wyoming Device Codec
//!
//! Length-framed binary event protocol spoken by voice satellite devices.
//!
//! ## Frame Layout:
//! A JSON header line terminated by `\n`:
//! `{"type": "...", "data_length": N, "payload_length": M}`
//! followed by exactly N bytes of JSON event data and M bytes of raw
//! payload. Audio travels as `audio-chunk` payload bytes; everything else is
//! JSON data.
//!
//! ## Event Types:
//! - inbound: `describe`, `transcribe`, `audio-start`, `audio-chunk`,
//!   `audio-stop`
//! - outbound: `info` (capability negotiation), `transcript`, `error`
//!
//! Session events with no device representation (VAD marks, run markers)
//! encode to `None` and are simply not sent.

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{InboundEvent, SessionEvent};
use crate::transcription::Capabilities;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bounds on frame parts, so a misbehaving client cannot make the
/// server allocate without limit.
const MAX_HEADER_BYTES: u64 = 8 * 1024;
const MAX_DATA_BYTES: u64 = 1024 * 1024;
const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data_length: Option<u64>,
    #[serde(default)]
    payload_length: Option<u64>,
}

/// One raw wire frame: type + JSON data + payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event_type: String,
    pub data: serde_json::Value,
    pub payload: Vec<u8>,
}

/// Decoded inbound device events.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Capability negotiation request.
    Describe,
    /// Begin a recognition session with optional overrides.
    Transcribe {
        name: Option<String>,
        language: Option<String>,
    },
    AudioStart,
    AudioChunk(Vec<u8>),
    AudioStop,
}

/// Read one frame, or `None` on a clean end of stream.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> GatewayResult<Option<Frame>> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| GatewayError::Internal(format!("frame header read: {}", e)))?;
    if read == 0 {
        return Ok(None);
    }
    if read as u64 > MAX_HEADER_BYTES {
        return Err(GatewayError::BadRequest("oversized frame header".to_string()));
    }

    let header: FrameHeader = serde_json::from_str(line.trim())
        .map_err(|e| GatewayError::BadRequest(format!("malformed frame header: {}", e)))?;

    let data_length = header.data_length.unwrap_or(0);
    let payload_length = header.payload_length.unwrap_or(0);
    if data_length > MAX_DATA_BYTES || payload_length > MAX_PAYLOAD_BYTES {
        return Err(GatewayError::BadRequest(format!(
            "oversized frame: data {} payload {}",
            data_length, payload_length
        )));
    }

    let data = if data_length > 0 {
        let mut buf = vec![0u8; data_length as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| GatewayError::Internal(format!("frame data read: {}", e)))?;
        serde_json::from_slice(&buf)
            .map_err(|e| GatewayError::BadRequest(format!("malformed frame data: {}", e)))?
    } else {
        serde_json::Value::Null
    };

    let mut payload = vec![0u8; payload_length as usize];
    if payload_length > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| GatewayError::Internal(format!("frame payload read: {}", e)))?;
    }

    Ok(Some(Frame {
        event_type: header.event_type,
        data,
        payload,
    }))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event_type: &str,
    data: serde_json::Value,
    payload: &[u8],
) -> GatewayResult<()> {
    let data_bytes = if data.is_null() {
        Vec::new()
    } else {
        serde_json::to_vec(&data)?
    };

    let header = serde_json::to_vec(&FrameHeader {
        event_type: event_type.to_string(),
        data_length: Some(data_bytes.len() as u64),
        payload_length: Some(payload.len() as u64),
    })?;

    writer.write_all(&header).await?;
    writer.write_all(b"\n").await?;
    writer.write_all(&data_bytes).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Interpret a raw frame as a device event; unknown types decode to `None`
/// so callers can skip them without dropping the connection.
pub fn decode_frame(frame: Frame) -> Option<DeviceEvent> {
    match frame.event_type.as_str() {
        "describe" | "info" => Some(DeviceEvent::Describe),
        "transcribe" => Some(DeviceEvent::Transcribe {
            name: frame.data.get("name").and_then(|v| v.as_str()).map(String::from),
            language: frame
                .data
                .get("language")
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        "audio-start" => Some(DeviceEvent::AudioStart),
        "audio-chunk" => Some(DeviceEvent::AudioChunk(frame.payload)),
        "audio-stop" => Some(DeviceEvent::AudioStop),
        _ => None,
    }
}

/// Map a device event onto the abstract vocabulary the session consumes.
///
/// `Describe` is negotiation, answered by the transport itself, and
/// `AudioStart` carries no session-relevant information; both map to `None`.
pub fn to_inbound(event: DeviceEvent) -> Option<InboundEvent> {
    match event {
        DeviceEvent::Describe | DeviceEvent::AudioStart => None,
        DeviceEvent::Transcribe { name, language } => Some(InboundEvent::Begin {
            language,
            model: name,
        }),
        DeviceEvent::AudioChunk(pcm) => Some(InboundEvent::Audio(pcm)),
        DeviceEvent::AudioStop => Some(InboundEvent::EndOfStream),
    }
}

/// Encode a session event as a device frame, if the protocol represents it.
pub fn encode_event(event: &SessionEvent) -> Option<(&'static str, serde_json::Value)> {
    match event {
        SessionEvent::Result(result) => Some((
            "transcript",
            json!({ "text": result.text, "language": result.language }),
        )),
        SessionEvent::Error { code, message } => {
            Some(("error", json!({ "code": code, "message": message })))
        }
        SessionEvent::SessionStarted { .. }
        | SessionEvent::RecognitionStarted
        | SessionEvent::VadStarted
        | SessionEvent::VadEnded
        | SessionEvent::SessionEnded => None,
    }
}

/// Capability-negotiation payload: supported models, languages, and the one
/// audio format the gateway accepts.
pub fn info_data(capabilities: &Capabilities) -> serde_json::Value {
    json!({
        "asr": [{
            "name": "whisper-gateway",
            "models": capabilities.models.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
            "languages": capabilities.languages,
            "audio_format": {
                "rate": 16000,
                "width": 2,
                "channels": 1
            }
        }]
    })
}
