//! # Inference Engine Contract
//!
//! The narrow seam between the gateway and the speech-recognition engine:
//! normalized PCM bytes in, [`TranscriptionResult`] out. The session
//! controller, the HTTP handlers, and the model registry all program against
//! these traits; the candle-backed Whisper implementation lives in
//! [`crate::transcription::model`], and tests substitute mocks.

use crate::error::GatewayResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// One timed span within a transcription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Transcribed text for this span.
    pub text: String,
    /// Start offset within the utterance, seconds.
    pub start: f64,
    /// End offset within the utterance, seconds.
    pub end: f64,
}

/// Result of transcribing one flushed utterance. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    /// Full transcript text (already trimmed).
    pub text: String,
    /// ISO 639-1 language code the engine transcribed in.
    pub language: String,
    /// Timed segments making up the transcript.
    pub segments: Vec<Segment>,
    /// Engine confidence, when the engine provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Duration of the transcribed audio, seconds.
    pub duration: f64,
}

/// A loaded speech-recognition model ready for inference.
///
/// Implementations must be safe to call from many sessions concurrently;
/// the registry hands out shared references, not exclusive ones.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Name of the loaded model ("tiny", "base", ...).
    fn model_name(&self) -> &str;

    /// Compute device the model runs on ("cpu", "cuda", "metal").
    fn device_name(&self) -> &str;

    /// Transcribe one utterance of 16 kHz mono 16-bit little-endian PCM.
    ///
    /// Fails with `TranscriptionFailure` for utterance-local problems; the
    /// caller decides whether that ends the session (it does not, for
    /// streaming sessions).
    async fn transcribe(
        &self,
        pcm: &[u8],
        language: Option<&str>,
    ) -> GatewayResult<TranscriptionResult>;
}

/// Factory for loading models by name.
///
/// `load` is the expensive operation the registry serializes; a failed load
/// must leave no shared state behind (the registry keeps the previous engine
/// in that case).
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(&self, name: &str) -> GatewayResult<Arc<dyn InferenceEngine>>;
}

/// Convert PCM bytes to the normalized f32 samples engines consume.
///
/// Scales from the i16 range into [-1.0, 1.0]. A trailing odd byte cannot
/// occur on buffered paths (the utterance buffer enforces whole samples) and
/// is ignored if present.
pub fn pcm_to_float(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}
