//! # Audio Normalization
//!
//! Wraps the external audio converter behind the narrow contract the rest of
//! the gateway relies on: `normalize(raw bytes) -> 16 kHz mono 16-bit PCM`.
//! Arbitrary containers and codecs are handed to ffmpeg; input that is
//! already a conformant WAV file is unpacked natively without spawning a
//! subprocess.
//!
//! Temporary files live only as long as their `NamedTempFile` handles, so
//! they are removed on every exit path, including conversion failures.

use crate::config::AudioSettings;
use crate::error::{GatewayError, GatewayResult};
use std::io::{Cursor, Write};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, warn};

/// Audio format converter collaborator.
///
/// Failure modes are split deliberately: ffmpeg rejecting the input is
/// `UnsupportedAudioFormat` (the client's problem), ffmpeg being absent or
/// failing to spawn is `Internal` (the operator's problem).
pub struct AudioNormalizer {
    sample_rate: u32,
    channels: u8,
}

impl AudioNormalizer {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
        }
    }

    /// Convert raw uploaded audio into normalized PCM bytes.
    pub async fn normalize(&self, raw: &[u8]) -> GatewayResult<Vec<u8>> {
        if raw.is_empty() {
            return Err(GatewayError::UnsupportedAudioFormat(
                "empty audio payload".to_string(),
            ));
        }

        if let Some(pcm) = self.native_wav_pcm(raw) {
            debug!("Input already conforms, skipping ffmpeg ({} PCM bytes)", pcm.len());
            return Ok(pcm);
        }

        self.convert_with_ffmpeg(raw).await
    }

    /// Fast path: unpack input that is already 16 kHz mono 16-bit WAV.
    fn native_wav_pcm(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let reader = hound::WavReader::new(Cursor::new(raw)).ok()?;
        let spec = reader.spec();

        if spec.sample_rate != self.sample_rate
            || spec.channels != self.channels as u16
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return None;
        }

        let samples: Result<Vec<i16>, _> = reader.into_samples::<i16>().collect();
        let samples = samples.ok()?;

        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Some(pcm)
    }

    /// Slow path: let ffmpeg decode whatever this is and resample it.
    async fn convert_with_ffmpeg(&self, raw: &[u8]) -> GatewayResult<Vec<u8>> {
        let mut input = NamedTempFile::new()?;
        input.write_all(raw)?;
        input.flush()?;
        let output = NamedTempFile::new()?;

        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input.path())
            .args(["-f", "s16le", "-acodec", "pcm_s16le"])
            .args(["-ac", &self.channels.to_string()])
            .args(["-ar", &self.sample_rate.to_string()])
            .arg(output.path())
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::Internal(
                    "audio converter unavailable: ffmpeg not found on PATH".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let reason = stderr.lines().last().unwrap_or("unknown decode error");
            warn!("ffmpeg rejected input: {}", reason);
            return Err(GatewayError::UnsupportedAudioFormat(reason.to_string()));
        }

        let pcm = tokio::fs::read(output.path()).await?;
        if pcm.is_empty() {
            return Err(GatewayError::UnsupportedAudioFormat(
                "input decoded to zero audio samples".to_string(),
            ));
        }
        Ok(pcm)
    }
}
