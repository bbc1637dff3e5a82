//! # Configuration Management
//!
//! Loads gateway configuration from multiple sources:
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! A handful of bare environment variables used by container deployments
//! (`HOST`, `PORT`, `WHISPER_MODEL`, `MAX_CONCURRENT`, `MAX_MEMORY`,
//! `WYOMING_HOST`, `WYOMING_PORT`) override their prefixed counterparts.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Bare deployment environment variables
//! 2. APP_-prefixed environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioSettings,
    pub limits: LimitsConfig,
    pub wyoming: WyomingConfig,
}

/// HTTP server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Inference model settings.
///
/// ## Fields:
/// - `default_model`: model loaded at startup and used when no `X-Model`
///   override is present ("tiny", "base", "small", "medium", "large-v3")
/// - `device`: compute device preference ("auto", "cpu", "cuda", "metal")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_model: String,
    pub device: String,
}

/// Audio pipeline settings.
///
/// The gateway pipeline is fixed to 16 kHz mono 16-bit PCM; these values are
/// validated rather than free parameters. `utterance_seconds` sets the
/// buffered-audio duration that triggers a transcription flush while voice
/// activity is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    pub utterance_seconds: u32,
    pub vad_threshold: f32,
    /// Chunk size advertised to streaming clients by POST /stream.
    pub stream_chunk_bytes: usize,
}

impl AudioSettings {
    /// Bytes of buffered PCM that trigger an utterance flush.
    ///
    /// sample_rate × bytes-per-sample × utterance_seconds
    /// (64 000 bytes for 2 s at 16 kHz/16-bit).
    pub fn flush_threshold_bytes(&self) -> usize {
        self.sample_rate as usize * (self.bit_depth as usize / 8) * self.utterance_seconds as usize
    }
}

/// Global admission limits.
///
/// ## Fields:
/// - `max_concurrent`: concurrent streaming/transcription sessions allowed
/// - `max_memory_mb`: resident-memory cap; new sessions are rejected while
///   the process is above it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrent: usize,
    pub max_memory_mb: u64,
}

/// Wyoming device-protocol listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WyomingConfig {
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                default_model: "tiny".to_string(),
                device: "auto".to_string(),
            },
            audio: AudioSettings {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
                utterance_seconds: 2,
                vad_threshold: 0.001,
                stream_chunk_bytes: 3200, // 100 ms at 16 kHz/16-bit mono
            },
            limits: LimitsConfig {
                max_concurrent: 5,
                max_memory_mb: 8192,
            },
            wyoming: WyomingConfig {
                host: "0.0.0.0".to_string(),
                port: 10300,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Bare deployment variables override the prefixed ones. These match
        // the names the service has historically been deployed with.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(model) = env::var("WHISPER_MODEL") {
            settings = settings.set_override("models.default_model", model)?;
        }
        if let Ok(max) = env::var("MAX_CONCURRENT") {
            settings = settings.set_override("limits.max_concurrent", max)?;
        }
        if let Ok(max) = env::var("MAX_MEMORY") {
            settings = settings.set_override("limits.max_memory_mb", max)?;
        }
        if let Ok(host) = env::var("WYOMING_HOST") {
            settings = settings.set_override("wyoming.host", host)?;
        }
        if let Ok(port) = env::var("WYOMING_PORT") {
            settings = settings.set_override("wyoming.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The audio pipeline is fixed to 16 kHz mono 16-bit PCM; anything else
    /// would silently break the flush-threshold arithmetic and the engine
    /// contract, so it is rejected here instead of at stream time.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.wyoming.port == 0 {
            return Err(anyhow::anyhow!("Wyoming port cannot be 0"));
        }

        if self.limits.max_concurrent == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.sample_rate != 16000 || self.audio.channels != 1 || self.audio.bit_depth != 16
        {
            return Err(anyhow::anyhow!(
                "Audio pipeline requires 16000 Hz, mono, 16-bit PCM (got {} Hz, {} ch, {} bit)",
                self.audio.sample_rate,
                self.audio.channels,
                self.audio.bit_depth
            ));
        }

        if self.audio.utterance_seconds == 0 {
            return Err(anyhow::anyhow!("Utterance duration must be greater than 0"));
        }

        if self.audio.vad_threshold <= 0.0 || self.audio.vad_threshold >= 1.0 {
            return Err(anyhow::anyhow!(
                "VAD threshold must be within (0, 1), got {}",
                self.audio.vad_threshold
            ));
        }

        if self.audio.stream_chunk_bytes == 0 || self.audio.stream_chunk_bytes % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Stream chunk size must be a positive even byte count"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.models.default_model, "tiny");
        assert_eq!(config.limits.max_concurrent, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_threshold_bytes() {
        let config = AppConfig::default();
        // 2 seconds of 16 kHz 16-bit mono audio
        assert_eq!(config.audio.flush_threshold_bytes(), 64_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate = 44100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.vad_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.stream_chunk_bytes = 3201;
        assert!(config.validate().is_err());
    }
}
