//! # Audio Pipeline Primitives
//!
//! The leaves of the streaming pipeline: voice-activity gating, utterance
//! buffering, and format normalization.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16 kHz
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono
//! - **Encoding**: Little-endian signed integers
//!
//! Everything upstream of these modules (the normalizer's ffmpeg call, the
//! inference engine) speaks this one format; the normalizer is the only
//! place other formats are allowed to exist.

pub mod buffer; // Append-until-flush utterance accumulation
pub mod normalizer; // ffmpeg-backed format conversion
pub mod vad; // Energy-based voice-activity gate

pub use buffer::UtteranceBuffer;
pub use normalizer::AudioNormalizer;
pub use vad::VoiceActivityGate;
