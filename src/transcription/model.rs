//! # Whisper Engine
//!
//! Candle-backed implementation of the inference-engine contract. Handles
//! model download (HuggingFace hub, cached locally), weight loading, and the
//! greedy decode loop that turns normalized PCM into a transcript with timed
//! segments.
//!
//! ## Model Loading Process:
//! 1. Resolve the model name to a HuggingFace repository
//! 2. Download config, tokenizer, and safetensors weights (cached)
//! 3. Initialize the model on the selected device
//!
//! Only one model is resident at a time; the registry owns swap ordering.

use crate::device::device_label;
use crate::error::{GatewayError, GatewayResult};
use crate::transcription::engine::{
    pcm_to_float, EngineLoader, InferenceEngine, Segment, TranscriptionResult,
};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Whisper decodes audio in windows of at most this many seconds.
const WINDOW_SECONDS: usize = 30;
/// Engine-native sample rate.
const SAMPLE_RATE: usize = 16000;
/// Hard cap on decoded tokens per window.
const MAX_DECODE_TOKENS: usize = 224;

/// Language codes the multilingual Whisper checkpoints understand.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Published Whisper checkpoints the gateway can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhisperVariant {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV3,
}

impl WhisperVariant {
    pub const ALL: [WhisperVariant; 5] = [
        WhisperVariant::Tiny,
        WhisperVariant::Base,
        WhisperVariant::Small,
        WhisperVariant::Medium,
        WhisperVariant::LargeV3,
    ];

    /// HuggingFace repository holding this checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            WhisperVariant::Tiny => "openai/whisper-tiny",
            WhisperVariant::Base => "openai/whisper-base",
            WhisperVariant::Small => "openai/whisper-small",
            WhisperVariant::Medium => "openai/whisper-medium",
            WhisperVariant::LargeV3 => "openai/whisper-large-v3",
        }
    }

    /// Names advertised in capability negotiation.
    pub fn supported_names() -> Vec<String> {
        Self::ALL.iter().map(|v| v.to_string()).collect()
    }
}

impl std::str::FromStr for WhisperVariant {
    type Err = GatewayError;

    fn from_str(s: &str) -> GatewayResult<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperVariant::Tiny),
            "base" => Ok(WhisperVariant::Base),
            "small" => Ok(WhisperVariant::Small),
            "medium" => Ok(WhisperVariant::Medium),
            "large-v3" | "large" => Ok(WhisperVariant::LargeV3),
            _ => Err(GatewayError::ModelLoadFailure(format!(
                "unsupported model: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for WhisperVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WhisperVariant::Tiny => "tiny",
            WhisperVariant::Base => "base",
            WhisperVariant::Small => "small",
            WhisperVariant::Medium => "medium",
            WhisperVariant::LargeV3 => "large-v3",
        };
        write!(f, "{}", name)
    }
}

/// Special-token ids resolved from the tokenizer once at load time.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

/// A loaded Whisper checkpoint.
///
/// The decoder keeps a KV cache across forward calls, so inference needs
/// exclusive access to the model; a `Mutex` provides it while `&self`
/// stays shareable across sessions.
pub struct WhisperEngine {
    model: Mutex<m::model::Whisper>,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    num_mel_bins: usize,
    special: SpecialTokens,
    device: Device,
    device_name: String,
    name: String,
}

impl WhisperEngine {
    /// Download (if needed) and load a Whisper checkpoint.
    pub async fn load(variant: WhisperVariant, device: Device) -> GatewayResult<Self> {
        info!("Loading Whisper {} from {}", variant, variant.repo_name());
        let started = std::time::Instant::now();

        let mut builder = hf_hub::api::tokio::ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        let api = builder
            .build()
            .map_err(|e| GatewayError::ModelLoadFailure(format!("hub client: {}", e)))?;
        let repo = api.model(variant.repo_name().to_string());

        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| GatewayError::ModelLoadFailure(format!("config.json: {}", e)))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| GatewayError::ModelLoadFailure(format!("tokenizer.json: {}", e)))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| GatewayError::ModelLoadFailure(format!("model.safetensors: {}", e)))?;

        let config: Config = serde_json::from_reader(
            std::fs::File::open(config_path)
                .map_err(|e| GatewayError::ModelLoadFailure(e.to_string()))?,
        )
        .map_err(|e| GatewayError::ModelLoadFailure(format!("config parse: {}", e)))?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| GatewayError::ModelLoadFailure(format!("tokenizer: {}", e)))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)
                .map_err(|e| GatewayError::ModelLoadFailure(format!("weights: {}", e)))?
        };
        let model = m::model::Whisper::load(&vb, config.clone())
            .map_err(|e| GatewayError::ModelLoadFailure(format!("model init: {}", e)))?;

        let num_mel_bins = config.num_mel_bins as usize;
        let mel_filters = mel_filter_bank(m::N_FFT / 2 + 1, num_mel_bins);
        let special = SpecialTokens {
            sot: token_id(&tokenizer, "<|startoftranscript|>", 50258),
            eot: token_id(&tokenizer, "<|endoftext|>", 50257),
            transcribe: token_id(&tokenizer, "<|transcribe|>", 50359),
            no_timestamps: token_id(&tokenizer, "<|notimestamps|>", 50363),
        };

        info!(
            "Whisper {} ready in {:.2}s",
            variant,
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            mel_filters,
            num_mel_bins,
            special,
            device_name: device_label(&device).to_string(),
            device,
            name: variant.to_string(),
        })
    }

    /// Language token id for a hint like "en", if the tokenizer knows it.
    fn language_token(&self, language: &str) -> Option<u32> {
        self.tokenizer
            .token_to_id(&format!("<|{}|>", language.to_lowercase()))
    }

    /// Greedy-decode one ≤30 s window of samples into text.
    async fn decode_window(&self, samples: &[f32], language: Option<&str>) -> GatewayResult<String> {
        let mel = self.log_mel_spectrogram(samples);
        let n_frames = mel.len() / self.num_mel_bins;
        let mel = Tensor::from_vec(mel, (1, self.num_mel_bins, n_frames), &self.device)
            .map_err(to_transcription_failure)?;

        let mut model = self.model.lock().await;
        let audio_features = model
            .encoder
            .forward(&mel, true)
            .map_err(to_transcription_failure)?;

        let mut tokens = vec![self.special.sot];
        if let Some(lang) = language {
            if let Some(lang_token) = self.language_token(lang) {
                tokens.push(lang_token);
            }
        }
        tokens.push(self.special.transcribe);
        tokens.push(self.special.no_timestamps);
        let prompt_len = tokens.len();

        for step in 0..MAX_DECODE_TOKENS {
            let input = Tensor::new(tokens.as_slice(), &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(to_transcription_failure)?;

            let hidden = model
                .decoder
                .forward(&input, &audio_features, step == 0)
                .map_err(to_transcription_failure)?;
            let last = hidden
                .i((..1, tokens.len() - 1..))
                .map_err(to_transcription_failure)?;
            let logits = model
                .decoder
                .final_linear(&last)
                .and_then(|t| t.i(0))
                .and_then(|t| t.i(0))
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(to_transcription_failure)?;

            let next = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx as u32)
                .unwrap_or(self.special.eot);

            if next == self.special.eot {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next) {
                debug!("Stopping decode on repetition after {} tokens", step);
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| GatewayError::TranscriptionFailure(format!("token decode: {}", e)))?;
        Ok(text.trim().to_string())
    }

    /// Log-mel features for one window, laid out `[mel_bin][frame]`.
    ///
    /// Plain DFT per frame (Hann-windowed), magnitudes folded through the
    /// triangular filter bank, log floor at 1e-5. Frames past the end of the
    /// audio keep the floor value, which zero-pads the window to the full
    /// 30 s the encoder expects.
    fn log_mel_spectrogram(&self, samples: &[f32]) -> Vec<f32> {
        let n_frames = WINDOW_SECONDS * SAMPLE_RATE / m::HOP_LENGTH;
        let n_bins = self.num_mel_bins;
        let n_freqs = m::N_FFT / 2 + 1;

        let hann: Vec<f32> = (0..m::N_FFT)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / m::N_FFT as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        let floor = 1e-5f32.ln();
        let mut mel = vec![floor; n_bins * n_frames];
        let mut spectrum = vec![0.0f32; n_freqs];

        for frame in 0..n_frames {
            let start = frame * m::HOP_LENGTH;
            if start >= samples.len() {
                break;
            }
            let window = &samples[start..(start + m::N_FFT).min(samples.len())];

            for (freq, slot) in spectrum.iter_mut().enumerate() {
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                for (i, (&sample, &w)) in window.iter().zip(&hann).enumerate() {
                    let angle = -2.0 * std::f32::consts::PI * freq as f32 * i as f32
                        / m::N_FFT as f32;
                    let value = sample * w;
                    re += value * angle.cos();
                    im += value * angle.sin();
                }
                *slot = re * re + im * im;
            }

            for bin in 0..n_bins {
                let filtered: f32 = self.mel_filters[bin * n_freqs..(bin + 1) * n_freqs]
                    .iter()
                    .zip(&spectrum)
                    .map(|(f, s)| f * s)
                    .sum();
                mel[bin * n_frames + frame] = filtered.max(1e-5).ln();
            }
        }
        mel
    }
}

#[async_trait]
impl InferenceEngine for WhisperEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }

    async fn transcribe(
        &self,
        pcm: &[u8],
        language: Option<&str>,
    ) -> GatewayResult<TranscriptionResult> {
        let samples = pcm_to_float(pcm);
        let duration = samples.len() as f64 / SAMPLE_RATE as f64;
        if samples.is_empty() {
            return Err(GatewayError::TranscriptionFailure(
                "utterance contained no samples".to_string(),
            ));
        }

        let window_len = WINDOW_SECONDS * SAMPLE_RATE;
        let mut segments = Vec::new();
        let mut parts = Vec::new();

        for (index, window) in samples.chunks(window_len).enumerate() {
            let text = self.decode_window(window, language).await?;
            let start = (index * WINDOW_SECONDS) as f64;
            let end = start + window.len() as f64 / SAMPLE_RATE as f64;
            if !text.is_empty() {
                parts.push(text.clone());
            }
            segments.push(Segment { text, start, end });
        }

        // Empty transcripts are a valid outcome (silence), not an error.
        let text = parts.join(" ").trim().to_string();
        if segments.iter().all(|s| s.text.is_empty()) {
            segments.clear();
        }

        Ok(TranscriptionResult {
            text,
            language: language.unwrap_or("en").to_string(),
            segments,
            confidence: None,
            duration,
        })
    }
}

/// Loads Whisper checkpoints onto a fixed device.
pub struct WhisperLoader {
    device: Device,
}

impl WhisperLoader {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

#[async_trait]
impl EngineLoader for WhisperLoader {
    async fn load(&self, name: &str) -> GatewayResult<Arc<dyn InferenceEngine>> {
        let variant: WhisperVariant = name.parse()?;
        let engine = WhisperEngine::load(variant, self.device.clone()).await?;
        Ok(Arc::new(engine))
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str, fallback: u32) -> u32 {
    tokenizer.token_to_id(token).unwrap_or(fallback)
}

fn to_transcription_failure(err: candle_core::Error) -> GatewayError {
    GatewayError::TranscriptionFailure(err.to_string())
}

/// Triangular mel filter bank, `[bin][freq]`, rows normalized to unit sum.
fn mel_filter_bank(n_freqs: usize, n_bins: usize) -> Vec<f32> {
    let mut filters = vec![0.0f32; n_bins * n_freqs];
    for bin in 0..n_bins {
        let center = (bin + 1) * n_freqs / (n_bins + 1);
        let width = (n_freqs / (n_bins + 1)).max(1);
        let mut sum = 0.0f32;
        for freq in 0..n_freqs {
            let distance = (freq as i32 - center as i32).unsigned_abs() as usize;
            if distance <= width {
                let weight = 1.0 - distance as f32 / width as f32;
                filters[bin * n_freqs + freq] = weight;
                sum += weight;
            }
        }
        if sum > 0.0 {
            for freq in 0..n_freqs {
                filters[bin * n_freqs + freq] /= sum;
            }
        }
    }
    filters
}

/// Token-level repetition guard for the greedy decode loop.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    if tokens.len() >= 3 {
        let tail = &tokens[tokens.len() - 3..];
        if tail.iter().all(|&t| t == next) {
            return true;
        }
    }
    if tokens.len() >= 6 {
        let last = &tokens[tokens.len() - 3..];
        let previous = &tokens[tokens.len() - 6..tokens.len() - 3];
        if last == previous {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        assert_eq!("tiny".parse::<WhisperVariant>().unwrap(), WhisperVariant::Tiny);
        assert_eq!(
            "LARGE-V3".parse::<WhisperVariant>().unwrap(),
            WhisperVariant::LargeV3
        );
        assert_eq!(
            "large".parse::<WhisperVariant>().unwrap(),
            WhisperVariant::LargeV3
        );
        assert!("humongous".parse::<WhisperVariant>().is_err());
    }

    #[test]
    fn test_supported_names_round_trip() {
        for name in WhisperVariant::supported_names() {
            assert!(name.parse::<WhisperVariant>().is_ok());
        }
    }

    #[test]
    fn test_language_list_has_common_codes() {
        for code in ["en", "es", "fr", "de", "ja", "zh"] {
            assert!(SUPPORTED_LANGUAGES.contains(&code));
        }
        assert_eq!(SUPPORTED_LANGUAGES.len(), 99);
    }

    #[test]
    fn test_mel_filter_bank_rows_normalized() {
        let n_freqs = m::N_FFT / 2 + 1;
        let filters = mel_filter_bank(n_freqs, 80);
        for bin in 0..80 {
            let sum: f32 = filters[bin * n_freqs..(bin + 1) * n_freqs].iter().sum();
            assert!((sum - 1.0).abs() < 1e-3, "bin {} sums to {}", bin, sum);
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[5, 5, 5], 5));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 9));
        assert!(!is_repetitive(&[1, 2, 3], 4));
        assert!(!is_repetitive(&[], 1));
    }
}
