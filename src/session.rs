//! # Session Controller
//!
//! Per-connection state machine for streaming recognition. The controller
//! consumes abstract inbound events (decoded by whichever codec the
//! transport uses), drives voice-activity gating and utterance buffering,
//! calls the inference engine on flush, and emits abstract session events
//! for the codec to encode. It has no knowledge of wire formats.
//!
//! ## State Machine:
//! `Idle → AwaitingAudio → Buffering ⇄ Transcribing → Closed`, with `Error`
//! reachable from any non-terminal state.
//!
//! - first audio chunk: AwaitingAudio → Buffering
//! - buffered audio ≥ flush threshold while VAD is active, or end of
//!   stream: Buffering → Transcribing
//! - a failed utterance reports an error event and returns to Buffering;
//!   only transport-level failures are terminal
//! - a stream that ends without ever producing non-empty text reports
//!   `no-speech-detected` before the session-end event
//!
//! The admission ticket is owned here and released when the controller
//! drops, whichever exit path got it there.

use crate::admission::AdmissionTicket;
use crate::audio::{UtteranceBuffer, VoiceActivityGate};
use crate::config::AudioSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{InboundEvent, SessionEvent};
use crate::transcription::ModelRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lifecycle states of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAudio,
    Buffering,
    Transcribing,
    Closed,
    Error,
}

/// Per-connection recognition state machine.
pub struct SessionController {
    id: String,
    state: SessionState,
    buffer: UtteranceBuffer,
    gate: VoiceActivityGate,
    vad_active: bool,
    language: Option<String>,
    model_override: Option<String>,
    produced_text: bool,
    started_at: DateTime<Utc>,
    registry: Arc<ModelRegistry>,
    cancel: Arc<Notify>,
    _ticket: AdmissionTicket,
}

impl SessionController {
    pub fn new(
        id: String,
        settings: &AudioSettings,
        language: Option<String>,
        registry: Arc<ModelRegistry>,
        ticket: AdmissionTicket,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            buffer: UtteranceBuffer::new(settings.flush_threshold_bytes()),
            gate: VoiceActivityGate::new(settings.vad_threshold),
            vad_active: false,
            language,
            model_override: None,
            produced_text: false,
            started_at: Utc::now(),
            registry,
            cancel: Arc::new(Notify::new()),
            _ticket: ticket,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Error)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Handle the transport uses to abort an in-flight transcription when
    /// the client disconnects.
    pub fn cancel_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.cancel)
    }

    /// Accept the connection: emits the session-start and recognition-start
    /// events and moves to `AwaitingAudio`.
    pub fn begin(&mut self) -> Vec<SessionEvent> {
        debug_assert_eq!(self.state, SessionState::Idle);
        self.state = SessionState::AwaitingAudio;
        info!("Session {} started", self.id);
        vec![
            SessionEvent::SessionStarted {
                session_id: self.id.clone(),
            },
            SessionEvent::RecognitionStarted,
        ]
    }

    /// Process one inbound event.
    ///
    /// `Ok(events)` carries everything to send to the client, in order.
    /// `Err` means a transport-level failure: the session is in `Error`
    /// state and the caller must stop without sending further events.
    pub async fn handle(&mut self, event: InboundEvent) -> GatewayResult<Vec<SessionEvent>> {
        if self.is_terminal() {
            warn!("Session {} received event after termination", self.id);
            return Ok(vec![]);
        }

        match event {
            InboundEvent::Begin { language, model } => {
                if language.is_some() {
                    self.language = language;
                }
                if model.is_some() {
                    self.model_override = model;
                }
                Ok(vec![])
            }
            InboundEvent::Audio(chunk) => self.on_audio(&chunk).await,
            InboundEvent::EndOfStream => self.on_end_of_stream().await,
        }
    }

    async fn on_audio(&mut self, chunk: &[u8]) -> GatewayResult<Vec<SessionEvent>> {
        if self.state == SessionState::AwaitingAudio {
            self.state = SessionState::Buffering;
        }

        let mut events = Vec::new();

        if let Err(err) = self.buffer.append(chunk) {
            // A malformed chunk is the client's problem, not the session's.
            events.push(SessionEvent::error(&err));
            return Ok(events);
        }

        // Edge-triggered VAD: one event per transition, nothing while the
        // gate state holds. The gate itself is re-evaluated per chunk with
        // no hysteresis.
        let speech = self.gate.detect(chunk);
        if speech != self.vad_active {
            self.vad_active = speech;
            events.push(if speech {
                SessionEvent::VadStarted
            } else {
                SessionEvent::VadEnded
            });
        }

        if self.buffer.should_flush(self.vad_active) {
            events.extend(self.flush_utterance().await?);
        }

        Ok(events)
    }

    async fn on_end_of_stream(&mut self) -> GatewayResult<Vec<SessionEvent>> {
        let mut events = Vec::new();

        // Drain whatever is buffered, regardless of VAD state.
        if !self.buffer.is_empty() {
            events.extend(self.flush_utterance().await?);
        }

        if !self.produced_text {
            events.push(SessionEvent::error(&GatewayError::NoSpeechDetected));
        }

        events.push(SessionEvent::SessionEnded);
        self.state = SessionState::Closed;
        info!("Session {} closed", self.id);
        Ok(events)
    }

    /// Hand the buffered utterance to the engine and translate the outcome
    /// into events.
    ///
    /// The buffer is reset before the engine call; audio arriving while the
    /// call is in flight is the transport's concern. A pending model
    /// override is applied first, so the load happens exactly once before
    /// the next transcription uses it.
    async fn flush_utterance(&mut self) -> GatewayResult<Vec<SessionEvent>> {
        self.state = SessionState::Transcribing;
        let pcm = self.buffer.take();
        let mut events = Vec::new();

        if pcm.is_empty() {
            self.state = SessionState::Buffering;
            return Ok(events);
        }

        if let Some(model) = self.model_override.clone() {
            if let Err(err) = self.registry.ensure_loaded(&model).await {
                warn!("Session {}: model override '{}' failed: {}", self.id, model, err);
                events.push(SessionEvent::error(&err));
                // Keep transcribing with the current model instead of
                // re-attempting the same failing load on every flush.
                self.model_override = None;
            }
        }

        debug!(
            "Session {}: transcribing {} byte utterance",
            self.id,
            pcm.len()
        );

        let outcome = tokio::select! {
            _ = self.cancel.notified() => Err(GatewayError::ClientDisconnected),
            result = self.registry.transcribe(&pcm, self.language.as_deref()) => result,
        };

        match outcome {
            Ok(result) => {
                if !result.text.trim().is_empty() {
                    self.produced_text = true;
                    events.push(SessionEvent::Result(result));
                }
                self.state = SessionState::Buffering;
                Ok(events)
            }
            Err(err) if err.is_fatal_for_session() => {
                warn!("Session {} failed: {}", self.id, err);
                self.state = SessionState::Error;
                Err(err)
            }
            Err(err) => {
                // One failed utterance does not tear the session down.
                warn!("Session {}: utterance failed: {}", self.id, err);
                events.push(SessionEvent::error(&err));
                self.state = SessionState::Buffering;
                Ok(events)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::AppConfig;
    use crate::transcription::engine::{EngineLoader, InferenceEngine};
    use crate::transcription::registry::Capabilities;
    use crate::transcription::TranscriptionResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine that transcribes non-silent audio to a fixed phrase and
    /// silence to an empty transcript.
    struct ScriptedEngine {
        name: String,
        calls: Arc<AtomicUsize>,
        received_bytes: Arc<std::sync::Mutex<Vec<usize>>>,
        fail_first: Arc<AtomicUsize>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
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
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received_bytes.lock().unwrap().push(pcm.len());

            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::TranscriptionFailure("scripted".into()));
            }

            let silent = pcm.iter().all(|&b| b == 0);
            Ok(TranscriptionResult {
                text: if silent {
                    String::new()
                } else {
                    format!("{} says hello", self.name)
                },
                language: language.unwrap_or("en").to_string(),
                segments: vec![],
                confidence: None,
                duration: pcm.len() as f64 / 32_000.0,
            })
        }
    }

    #[derive(Clone)]
    struct ScriptedLoader {
        loads: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
        received_bytes: Arc<std::sync::Mutex<Vec<usize>>>,
        fail_first: Arc<AtomicUsize>,
        delay: std::time::Duration,
    }

    impl Default for ScriptedLoader {
        fn default() -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
                received_bytes: Arc::new(std::sync::Mutex::new(Vec::new())),
                fail_first: Arc::new(AtomicUsize::new(0)),
                delay: std::time::Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl EngineLoader for ScriptedLoader {
        async fn load(&self, name: &str) -> GatewayResult<Arc<dyn InferenceEngine>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedEngine {
                name: name.to_string(),
                calls: Arc::clone(&self.calls),
                received_bytes: Arc::clone(&self.received_bytes),
                fail_first: Arc::clone(&self.fail_first),
                delay: self.delay,
            }))
        }
    }

    async fn controller_with(loader: ScriptedLoader) -> SessionController {
        let registry = Arc::new(
            ModelRegistry::initialize(
                Box::new(loader),
                "tiny",
                Capabilities {
                    models: vec!["tiny".into(), "base".into()],
                    languages: vec!["en".into()],
                },
            )
            .await
            .unwrap(),
        );
        let admission = AdmissionController::new(4, u64::MAX / (1024 * 1024));
        SessionController::new(
            "test-session".into(),
            &AppConfig::default().audio,
            None,
            registry,
            admission.acquire().unwrap(),
        )
    }

    /// 100 ms chunk of a 440 Hz tone, always above the energy threshold.
    fn tone_chunk() -> Vec<u8> {
        (0..1600)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 12_000.0) as i16
            })
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn silent_chunk() -> Vec<u8> {
        vec![0u8; 3200]
    }

    fn count_results(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Result(_)))
            .count()
    }

    #[tokio::test]
    async fn test_begin_emits_start_events() {
        let mut controller = controller_with(ScriptedLoader::default()).await;
        let events = controller.begin();
        assert_eq!(
            events,
            vec![
                SessionEvent::SessionStarted {
                    session_id: "test-session".into()
                },
                SessionEvent::RecognitionStarted,
            ]
        );
        assert_eq!(controller.state(), SessionState::AwaitingAudio);
    }

    #[tokio::test]
    async fn test_tone_stream_vad_before_single_result_then_keeps_buffering() {
        let loader = ScriptedLoader::default();
        let calls = Arc::clone(&loader.calls);
        let mut controller = controller_with(loader).await;
        controller.begin();

        let mut all_events = Vec::new();
        // 2.5 s of tone in 100 ms chunks; threshold is 2 s.
        for _ in 0..25 {
            all_events.extend(controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap());
        }

        // vad-start arrives before any recognition result.
        let vad_pos = all_events
            .iter()
            .position(|e| *e == SessionEvent::VadStarted)
            .expect("vad-start emitted");
        let result_pos = all_events
            .iter()
            .position(|e| matches!(e, SessionEvent::Result(_)))
            .expect("result emitted");
        assert!(vad_pos < result_pos);

        // Exactly one flush at the 2 s mark, then buffering continues.
        assert_eq!(count_results(&all_events), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), SessionState::Buffering);

        // The trailing 0.5 s is still buffered for the next utterance.
        let ended = controller.handle(InboundEvent::EndOfStream).await.unwrap();
        assert_eq!(count_results(&ended), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_vad_events_are_edge_triggered() {
        let mut controller = controller_with(ScriptedLoader::default()).await;
        controller.begin();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.extend(controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap());
        }
        for _ in 0..2 {
            events.extend(controller.handle(InboundEvent::Audio(silent_chunk())).await.unwrap());
        }

        let starts = events.iter().filter(|e| **e == SessionEvent::VadStarted).count();
        let ends = events.iter().filter(|e| **e == SessionEvent::VadEnded).count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn test_silent_stream_reports_no_speech() {
        let loader = ScriptedLoader::default();
        let received = Arc::clone(&loader.received_bytes);
        let mut controller = controller_with(loader).await;
        controller.begin();

        for _ in 0..5 {
            let events = controller.handle(InboundEvent::Audio(silent_chunk())).await.unwrap();
            assert_eq!(count_results(&events), 0);
        }

        let events = controller.handle(InboundEvent::EndOfStream).await.unwrap();
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Error { code, .. }, SessionEvent::SessionEnded]
                if code == "no-speech-detected"
        ));
        assert_eq!(controller.state(), SessionState::Closed);

        // End-of-stream drained exactly the buffered bytes; the sentinel
        // frame itself was never appended.
        assert_eq!(received.lock().unwrap().as_slice(), &[5 * 3200]);
    }

    #[tokio::test]
    async fn test_end_of_stream_with_no_audio_skips_engine() {
        let loader = ScriptedLoader::default();
        let calls = Arc::clone(&loader.calls);
        let mut controller = controller_with(loader).await;
        controller.begin();

        let events = controller.handle(InboundEvent::EndOfStream).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(events.last(), Some(SessionEvent::SessionEnded)));
    }

    #[tokio::test]
    async fn test_failed_utterance_does_not_end_session() {
        let loader = ScriptedLoader::default();
        loader.fail_first.store(1, Ordering::SeqCst);
        let calls = Arc::clone(&loader.calls);
        let mut controller = controller_with(loader).await;
        controller.begin();

        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Error { code, .. } if code == "transcription-failed")));
        assert_eq!(controller.state(), SessionState::Buffering);

        // The next utterance goes through normally.
        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap());
        }
        assert_eq!(count_results(&events), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_model_override_loads_once_before_next_transcription() {
        let loader = ScriptedLoader::default();
        let loads = Arc::clone(&loader.loads);
        let mut controller = controller_with(loader).await;
        controller.begin();

        controller
            .handle(InboundEvent::Begin {
                language: Some("en".into()),
                model: Some("base".into()),
            })
            .await
            .unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1); // startup only, no eager load

        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        match events.iter().find(|e| matches!(e, SessionEvent::Result(_))) {
            Some(SessionEvent::Result(result)) => {
                assert!(result.text.starts_with("base"));
            }
            _ => panic!("expected a result event"),
        }

        // A second flush does not reload.
        for _ in 0..20 {
            controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_transcription() {
        let loader = ScriptedLoader {
            delay: std::time::Duration::from_secs(30),
            ..ScriptedLoader::default()
        };
        let mut controller = controller_with(loader).await;
        controller.begin();

        let cancel = controller.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            // notify_one stores a permit, so cancellation also lands if the
            // flush has not reached its select yet.
            cancel.notify_one();
        });

        let mut outcome = Ok(vec![]);
        for _ in 0..20 {
            outcome = controller.handle(InboundEvent::Audio(tone_chunk())).await;
            if outcome.is_err() {
                break;
            }
        }

        match outcome {
            Err(GatewayError::ClientDisconnected) => {
                assert_eq!(controller.state(), SessionState::Error)
            }
            other => panic!("expected disconnect cancellation, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_events_after_close_are_ignored() {
        let mut controller = controller_with(ScriptedLoader::default()).await;
        controller.begin();
        controller.handle(InboundEvent::EndOfStream).await.unwrap();

        let events = controller.handle(InboundEvent::Audio(tone_chunk())).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_odd_length_chunk_reports_error_and_continues() {
        let mut controller = controller_with(ScriptedLoader::default()).await;
        controller.begin();

        let events = controller
            .handle(InboundEvent::Audio(vec![0u8; 3201]))
            .await
            .unwrap();
        assert!(matches!(events.as_slice(), [SessionEvent::Error { .. }]));
        assert!(!controller.is_terminal());
    }
}
