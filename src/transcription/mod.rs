//! # Transcription
//!
//! Speech-to-text via Whisper models on the Candle framework — pure Rust,
//! no FFI into whisper.cpp.
//!
//! ## Key Components:
//! - **engine**: the collaborator contract (`InferenceEngine`/`EngineLoader`)
//!   and result types the rest of the gateway programs against
//! - **model**: the candle-backed Whisper implementation of that contract
//! - **registry**: single owner of the currently loaded model, including
//!   serialized hot-swap
//!
//! ## Whisper Checkpoints:
//! - **tiny**: ~39 MB, fastest, least accurate
//! - **base**: ~74 MB, good for development
//! - **small**: ~244 MB, better accuracy
//! - **medium**: ~769 MB, good technical vocabulary
//! - **large-v3**: ~1.5 GB, best accuracy, slowest

pub mod engine; // Collaborator contract and result types
pub mod model; // Candle Whisper implementation
pub mod registry; // Current-model ownership and hot-swap

pub use engine::{EngineLoader, InferenceEngine, Segment, TranscriptionResult};
pub use registry::{Capabilities, ModelRegistry};
