//! # Utterance Buffer
//!
//! Append-only accumulation of normalized PCM between transcription flushes.
//! The buffer grows until one of two flush conditions holds:
//!
//! 1. the buffered length reached the flush threshold **and** voice activity
//!    is currently present, or
//! 2. the stream ended (flush whatever remains, regardless of gate state).
//!
//! After a flush the buffer is empty and accumulation resumes for the next
//! utterance within the same session.

use crate::error::{GatewayError, GatewayResult};

/// Growable PCM buffer with a size-plus-gate flush policy.
///
/// ## Invariant:
/// The buffer always holds a whole number of 16-bit samples; chunks with an
/// odd byte count are rejected at append time.
#[derive(Debug)]
pub struct UtteranceBuffer {
    data: Vec<u8>,
    flush_threshold_bytes: usize,
}

impl UtteranceBuffer {
    /// Create an empty buffer that flushes at `flush_threshold_bytes`.
    pub fn new(flush_threshold_bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(flush_threshold_bytes),
            flush_threshold_bytes,
        }
    }

    /// Append a PCM chunk (framing byte already stripped by the codec).
    pub fn append(&mut self, chunk: &[u8]) -> GatewayResult<()> {
        if chunk.len() % 2 != 0 {
            return Err(GatewayError::BadRequest(
                "audio chunk must contain whole 16-bit samples".to_string(),
            ));
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Whether the size-based flush condition holds right now.
    ///
    /// Never true below the threshold; never true while the gate reports
    /// silence. End-of-stream flushes bypass this check via [`take`].
    ///
    /// [`take`]: UtteranceBuffer::take
    pub fn should_flush(&self, vad_active: bool) -> bool {
        vad_active && self.data.len() >= self.flush_threshold_bytes
    }

    /// Drain the buffered utterance, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Duration of the buffered audio in seconds at the given sample rate.
    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        (self.data.len() / 2) as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: usize = 64_000; // 2 s at 16 kHz/16-bit

    #[test]
    fn test_no_flush_below_threshold_even_with_vad() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        // 1.9 s of audio in 100 ms chunks
        for _ in 0..19 {
            buffer.append(&[1u8; 3200]).unwrap();
            assert!(!buffer.should_flush(true));
        }
    }

    #[test]
    fn test_no_flush_without_vad_even_above_threshold() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        buffer.append(&vec![0u8; THRESHOLD + 3200]).unwrap();
        assert!(!buffer.should_flush(false));
        assert!(buffer.should_flush(true));
    }

    #[test]
    fn test_flush_exactly_at_threshold() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        buffer.append(&vec![0u8; THRESHOLD]).unwrap();
        assert!(buffer.should_flush(true));
    }

    #[test]
    fn test_take_resets_buffer() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        buffer.append(&[7u8; 6400]).unwrap();
        let drained = buffer.take();
        assert_eq!(drained.len(), 6400);
        assert!(buffer.is_empty());

        // Accumulation resumes after the flush.
        buffer.append(&[7u8; 3200]).unwrap();
        assert_eq!(buffer.len(), 3200);
    }

    #[test]
    fn test_odd_length_chunk_rejected() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        assert!(buffer.append(&[0u8; 3201]).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duration_seconds() {
        let mut buffer = UtteranceBuffer::new(THRESHOLD);
        buffer.append(&vec![0u8; 32_000]).unwrap();
        assert!((buffer.duration_seconds(16000) - 1.0).abs() < f64::EPSILON);
    }
}
