//! # Application State
//!
//! Shared state handed to every HTTP request handler, WebSocket actor, and
//! Wyoming client task. The mutable pieces (admission counters, the current
//! model) carry their own synchronization; the state struct itself is a bag
//! of cheaply clonable `Arc` handles.

use crate::admission::AdmissionController;
use crate::audio::AudioNormalizer;
use crate::config::AppConfig;
use crate::device::select_device;
use crate::transcription::model::{WhisperLoader, SUPPORTED_LANGUAGES, WhisperVariant};
use crate::transcription::{Capabilities, ModelRegistry};
use anyhow::Context;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    pub admission: Arc<AdmissionController>,
    pub registry: Arc<ModelRegistry>,
    pub normalizer: Arc<AudioNormalizer>,
    start_time: Instant,
}

impl AppState {
    /// Build production state: select a device, load the default model
    /// (fatal on failure — the gateway has nothing to serve without it),
    /// and wire up the admission gate and normalizer.
    pub async fn initialize(config: AppConfig) -> anyhow::Result<Self> {
        let device = select_device(&config.models.device);
        let capabilities = Capabilities {
            models: WhisperVariant::supported_names(),
            languages: SUPPORTED_LANGUAGES.iter().map(|l| l.to_string()).collect(),
        };

        let registry = ModelRegistry::initialize(
            Box::new(WhisperLoader::new(device)),
            &config.models.default_model,
            capabilities,
        )
        .await
        .with_context(|| {
            format!(
                "failed to load startup model '{}'",
                config.models.default_model
            )
        })?;

        Ok(Self::with_components(config, Arc::new(registry)))
    }

    /// Assemble state around an already-built registry.
    pub fn with_components(config: AppConfig, registry: Arc<ModelRegistry>) -> Self {
        let admission = AdmissionController::new(
            config.limits.max_concurrent,
            config.limits.max_memory_mb,
        );
        let normalizer = AudioNormalizer::new(&config.audio);

        Self {
            config: Arc::new(RwLock::new(config)),
            admission: Arc::new(admission),
            registry,
            normalizer: Arc::new(normalizer),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; cloning releases the lock
    /// immediately so readers never block each other.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
