//! # Voice Activity Gate
//!
//! Energy-based speech/silence classification for a single PCM chunk.
//! The gate is stateless: each chunk is judged on its own, with no debounce
//! or hysteresis window, so the decision can flip on every chunk. Edge
//! detection (silence→speech, speech→silence) is the session controller's
//! job, not the gate's.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Default normalized-energy threshold separating speech from silence.
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.001;

/// Stateless voice-activity decision function.
///
/// `detect` interprets the chunk as 16-bit signed little-endian samples,
/// computes the mean absolute amplitude normalized by the maximum
/// representable magnitude (32768), and compares it against the threshold.
/// Identical bytes always yield the identical boolean.
#[derive(Debug, Clone, Copy)]
pub struct VoiceActivityGate {
    threshold: f32,
}

impl VoiceActivityGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify a PCM chunk as speech (`true`) or silence (`false`).
    ///
    /// A chunk too short to contain a whole sample is silence.
    pub fn detect(&self, chunk: &[u8]) -> bool {
        Self::normalized_energy(chunk) > self.threshold
    }

    /// Mean absolute sample value scaled into [0.0, 1.0].
    pub fn normalized_energy(chunk: &[u8]) -> f32 {
        let mut cursor = Cursor::new(chunk);
        let mut sum: u64 = 0;
        let mut count: u64 = 0;

        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            sum += sample.unsigned_abs() as u64;
            count += 1;
        }

        if count == 0 {
            return 0.0;
        }

        (sum as f64 / count as f64 / 32768.0) as f32
    }
}

impl Default for VoiceActivityGate {
    fn default() -> Self {
        Self::new(DEFAULT_VAD_THRESHOLD)
    }
}
