//! # Model Registry
//!
//! Single owner of the currently loaded inference model. All sessions read
//! the current engine through this registry; model hot-swaps are serialized
//! here so two swap requests can never interleave and readers always observe
//! either the pre-swap or the post-swap engine, never a half-swapped state.
//!
//! ## Locking Discipline:
//! - `current` (RwLock): readers snapshot the engine handle under a short
//!   read lock and run inference outside it
//! - `swap` (Mutex): held across the whole load-and-replace sequence; the
//!   expensive `EngineLoader::load` happens while readers keep using the old
//!   engine, and only the final pointer replacement takes the write lock
//!
//! A failed load leaves the previous model completely undisturbed.

use crate::error::{GatewayError, GatewayResult};
use crate::transcription::engine::{EngineLoader, InferenceEngine, TranscriptionResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Capability metadata advertised to clients (Wyoming `info`, /health).
///
/// Immutable for the lifetime of the process; handed out as cheap snapshots.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub models: Vec<String>,
    pub languages: Vec<String>,
}

struct Loaded {
    engine: Arc<dyn InferenceEngine>,
    name: String,
}

/// Serializes access to the single currently loaded model.
pub struct ModelRegistry {
    loader: Box<dyn EngineLoader>,
    current: RwLock<Loaded>,
    swap: Mutex<()>,
    capabilities: Capabilities,
}

impl ModelRegistry {
    /// Load the default model and build the registry around it.
    ///
    /// A failure here is fatal: the process has no model to serve with.
    pub async fn initialize(
        loader: Box<dyn EngineLoader>,
        default_model: &str,
        capabilities: Capabilities,
    ) -> GatewayResult<Self> {
        let engine = loader.load(default_model).await?;
        info!("Startup model loaded: {}", default_model);

        Ok(Self {
            loader,
            current: RwLock::new(Loaded {
                engine,
                name: default_model.to_string(),
            }),
            swap: Mutex::new(()),
            capabilities,
        })
    }

    /// Make `name` the current model, swapping if it is not already loaded.
    ///
    /// No-op when the name matches the loaded model. Otherwise the swap is
    /// serialized behind the swap mutex: concurrent requests for the same
    /// model perform exactly one load (the loser of the race re-checks and
    /// returns). Swap failure is reported to the caller and the previous
    /// model keeps serving.
    pub async fn ensure_loaded(&self, name: &str) -> GatewayResult<()> {
        if self.current.read().await.name == name {
            return Ok(());
        }

        if !self.capabilities.models.iter().any(|m| m == name) {
            return Err(GatewayError::ModelLoadFailure(format!(
                "unsupported model: {}",
                name
            )));
        }

        let _guard = self.swap.lock().await;

        // A racing swap may have loaded it while we waited for the guard.
        if self.current.read().await.name == name {
            return Ok(());
        }

        let started = Instant::now();
        let engine = self.loader.load(name).await?;

        {
            let mut current = self.current.write().await;
            *current = Loaded {
                engine,
                name: name.to_string(),
            };
        }

        info!(
            "Model swapped to {} in {:.2}s",
            name,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Name of the currently loaded model.
    pub async fn current_name(&self) -> String {
        self.current.read().await.name.clone()
    }

    /// Device the current model runs on.
    pub async fn current_device(&self) -> String {
        self.current.read().await.engine.device_name().to_string()
    }

    /// Snapshot of the current engine; inference runs on the snapshot, so a
    /// concurrent swap does not block or redirect an in-flight call.
    pub async fn snapshot(&self) -> Arc<dyn InferenceEngine> {
        Arc::clone(&self.current.read().await.engine)
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Transcribe one utterance with the current model.
    pub async fn transcribe(
        &self,
        pcm: &[u8],
        language: Option<&str>,
    ) -> GatewayResult<TranscriptionResult> {
        let engine = self.snapshot().await;
        engine.transcribe(pcm, language).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEngine {
        name: String,
    }

    #[async_trait]
    impl InferenceEngine for FakeEngine {
        fn model_name(&self) -> &str {
            &self.name
        }

        fn device_name(&self) -> &str {
            "cpu"
        }

        async fn transcribe(
            &self,
            pcm: &[u8],
            language: Option<&str>,
        ) -> GatewayResult<TranscriptionResult> {
            Ok(TranscriptionResult {
                text: format!("{} heard {} bytes", self.name, pcm.len()),
                language: language.unwrap_or("en").to_string(),
                segments: vec![],
                confidence: None,
                duration: pcm.len() as f64 / 32000.0,
            })
        }
    }

    struct CountingLoader {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EngineLoader for CountingLoader {
        async fn load(&self, name: &str) -> GatewayResult<Arc<dyn InferenceEngine>> {
            if name == "broken" {
                return Err(GatewayError::ModelLoadFailure("weights corrupt".into()));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeEngine {
                name: name.to_string(),
            }))
        }
    }

    fn capabilities() -> Capabilities {
        Capabilities {
            models: vec!["tiny".into(), "base".into(), "broken".into()],
            languages: vec!["en".into(), "es".into()],
        }
    }

    async fn registry(loads: Arc<AtomicUsize>) -> ModelRegistry {
        ModelRegistry::initialize(
            Box::new(CountingLoader { loads }),
            "tiny",
            capabilities(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_same_name_is_a_noop() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&loads)).await;
        assert_eq!(loads.load(Ordering::SeqCst), 1); // startup load

        registry.ensure_loaded("tiny").await.unwrap();
        registry.ensure_loaded("tiny").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_override_triggers_exactly_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&loads)).await;

        registry.ensure_loaded("base").await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(registry.current_name().await, "base");

        // The next transcription uses the swapped model.
        let result = registry.transcribe(&[0u8; 4], None).await.unwrap();
        assert!(result.text.starts_with("base"));
    }

    #[tokio::test]
    async fn test_concurrent_swaps_to_same_model_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry(Arc::clone(&loads)).await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.ensure_loaded("base").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // One startup load plus one swap, regardless of contention.
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_swap_keeps_previous_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&loads)).await;

        let err = registry.ensure_loaded("broken").await.unwrap_err();
        assert_eq!(err.code(), "model-load-failed");

        assert_eq!(registry.current_name().await, "tiny");
        let result = registry.transcribe(&[0u8; 4], Some("es")).await.unwrap();
        assert!(result.text.starts_with("tiny"));
        assert_eq!(result.language, "es");
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_without_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&loads)).await;

        assert!(registry.ensure_loaded("gigantic").await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
