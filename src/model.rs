//! Duplex session against the conversational speech model.
//!
//! Owns the network channel and the resumption handle. Audio flows up via
//! `send_audio`, model audio/text/tool-calls flow back through
//! `process_responses`, one call per turn. The connection can be resumed
//! after a drop using the opaque handle the server pushes periodically.

pub mod transport;
pub mod wire;

pub use transport::{ModelConnector, TransportSink, TransportStream, WsConnector};
pub use wire::ToolDeclaration;

use crate::audio::{AudioSource, CAPTURE_SAMPLE_RATE};
use crate::dashboard::ConversationLogger;
use crate::relay::SessionState;
use crate::tools::ToolDispatcher;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use wire::{
    ClientContent, ClientMessage, ContentBlock, FunctionResponse, RealtimeInput,
    SessionResumptionConfig, SessionSetup, SpeechConfig, ToolGroup, ToolResponseFrame,
};

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Not connected to the speech model")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Connection reset: {0}")]
    ConnectionReset(String),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Announcement delivery priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncePriority {
    /// Send right now (safe-point loop already checked timing).
    Immediate,
    /// Queue for the background announcement pump.
    Queued,
}

/// Turn phases inside `process_responses`. The outer loop owns the channel
/// and is cancellable between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Awaiting,
    ReadingAudio,
    ReadingText,
    ReceivingToolCall,
    SendingToolResponse,
    TurnComplete,
}

pub struct ModelSession {
    /// Self-handle for spawning the announcement pump.
    weak: Weak<ModelSession>,
    connector: Box<dyn ModelConnector>,
    model_name: String,
    system_prompt: String,
    voice_name: String,

    dispatcher: Arc<ToolDispatcher>,
    audio: Arc<dyn AudioSource>,
    session_state: Arc<SessionState>,
    logger: Arc<ConversationLogger>,

    sink: tokio::sync::Mutex<Option<Box<dyn TransportSink>>>,
    stream: tokio::sync::Mutex<Option<Box<dyn TransportStream>>>,

    connected: AtomicBool,
    go_away: AtomicBool,
    generating: AtomicBool,
    in_tool_call: AtomicBool,

    session_handle: Mutex<Option<String>>,
    last_tools: Mutex<Option<Vec<ToolDeclaration>>>,
    last_response_time: Mutex<Option<Instant>>,
    last_turn_complete: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,

    announcement_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<String>>>,
    pump_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModelSession {
    pub fn new(
        connector: Box<dyn ModelConnector>,
        model_name: impl Into<String>,
        system_prompt: impl Into<String>,
        dispatcher: Arc<ToolDispatcher>,
        audio: Arc<dyn AudioSource>,
        session_state: Arc<SessionState>,
        logger: Arc<ConversationLogger>,
    ) -> Arc<Self> {
        let model_name = model_name.into();
        let system_prompt = system_prompt.into();
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            connector,
            model_name,
            system_prompt,
            voice_name: "Kore".to_string(),
            dispatcher,
            audio,
            session_state,
            logger,
            sink: tokio::sync::Mutex::new(None),
            stream: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            go_away: AtomicBool::new(false),
            generating: AtomicBool::new(false),
            in_tool_call: AtomicBool::new(false),
            session_handle: Mutex::new(None),
            last_tools: Mutex::new(None),
            last_response_time: Mutex::new(None),
            last_turn_complete: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            announcement_tx: Mutex::new(None),
            pump_task: Mutex::new(None),
        })
    }

    // ==================== Connection lifecycle ====================

    /// Open the session. With a `resume_handle` the server re-attaches to
    /// the prior conversation; without one we request resumption tokens for
    /// future reconnects.
    pub async fn connect(
        &self,
        tools: Vec<ToolDeclaration>,
        resume_handle: Option<String>,
    ) -> ModelResult<()> {
        *self.last_tools.lock().unwrap() = Some(tools.clone());

        if resume_handle.is_some() {
            tracing::info!("Resuming model session with stored handle");
        } else {
            tracing::info!(tool_count = tools.len(), "Starting new model session");
        }

        let setup = SessionSetup {
            model: self.model_name.clone(),
            system_instruction: ContentBlock::system(&self.system_prompt),
            tools: vec![ToolGroup { function_declarations: tools }],
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: Some(SpeechConfig { voice_name: self.voice_name.clone() }),
            realtime_input_config: Default::default(),
            session_resumption: SessionResumptionConfig { handle: resume_handle },
        };

        let (mut sink, stream) = self.connector.connect().await?;
        sink.send(ClientMessage::Setup { setup }).await?;

        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        self.go_away.store(false, Ordering::SeqCst);
        *self.last_response_time.lock().unwrap() = Some(Instant::now());
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        self.start_announcement_pump();
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.stop_announcement_pump();
        if let Some(mut sink) = self.sink.lock().await.take() {
            sink.close().await;
        }
        *self.stream.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Attempt to reconnect with exponential backoff and the stored
    /// resumption handle. Returns true iff reconnected.
    pub async fn reconnect(&self) -> bool {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            tracing::warn!(max = MAX_RECONNECT_ATTEMPTS, "Reconnect attempts exhausted");
            return false;
        }

        let delay = reconnect_delay(attempt);
        let handle = self.session_handle.lock().unwrap().clone();
        tracing::info!(
            attempt,
            max = MAX_RECONNECT_ATTEMPTS,
            delay_secs = delay.as_secs_f64(),
            has_handle = handle.is_some(),
            "Reconnecting to model"
        );
        tokio::time::sleep(delay).await;

        self.disconnect().await;

        let tools = match self.last_tools.lock().unwrap().clone() {
            Some(tools) => tools,
            None => {
                tracing::warn!("No tools stored; cannot reconnect");
                return false;
            }
        };

        match self.connect(tools, handle).await {
            Ok(()) => {
                tracing::info!("Reconnected, session resumed");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect failed");
                false
            }
        }
    }

    pub fn can_reconnect(&self) -> bool {
        self.reconnect_attempts.load(Ordering::SeqCst) < MAX_RECONNECT_ATTEMPTS
            && self.last_tools.lock().unwrap().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    pub fn is_in_tool_call(&self) -> bool {
        self.in_tool_call.load(Ordering::SeqCst)
    }

    pub fn session_handle(&self) -> Option<String> {
        self.session_handle.lock().unwrap().clone()
    }

    /// Time since the last turn completed, if any turn has completed.
    pub fn time_since_turn_complete(&self) -> Option<Duration> {
        self.last_turn_complete.lock().unwrap().map(|t| t.elapsed())
    }

    /// Healthy means connected, no go-away received, and some inbound
    /// traffic within `max_idle`.
    pub fn is_connection_healthy(&self, max_idle: Duration) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        if self.go_away.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(last) = *self.last_response_time.lock().unwrap() {
            if last.elapsed() > max_idle {
                tracing::warn!(idle_secs = last.elapsed().as_secs(), "Connection idle too long");
                return false;
            }
        }
        true
    }

    // ==================== Upstream ====================

    async fn send(&self, msg: ClientMessage) -> ModelResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ModelError::NotConnected);
        }
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                let result = sink.send(msg).await;
                if result.is_err() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                result
            }
            None => Err(ModelError::NotConnected),
        }
    }

    /// Send a captured PCM16 mono 16 kHz frame.
    pub async fn send_audio(&self, pcm: &[u8]) -> ModelResult<()> {
        self.send(ClientMessage::RealtimeInput {
            realtime_input: RealtimeInput {
                audio: Some(wire::AudioBlob::pcm16(pcm, CAPTURE_SAMPLE_RATE)),
                audio_stream_end: None,
            },
        })
        .await
    }

    /// Signal end of the audio stream so server-side VAD closes the turn.
    pub async fn send_audio_end(&self) -> ModelResult<()> {
        self.send(ClientMessage::RealtimeInput {
            realtime_input: RealtimeInput { audio: None, audio_stream_end: Some(true) },
        })
        .await
    }

    /// Send a typed text turn.
    pub async fn send_text(&self, text: &str) -> ModelResult<()> {
        self.send(ClientMessage::ClientContent {
            client_content: ClientContent {
                turns: vec![ContentBlock::user_text(text)],
                turn_complete: true,
            },
        })
        .await
    }

    // ==================== Announcements ====================

    /// Voice feedback the model reads aloud. Immediate goes out now; queued
    /// waits for the background pump.
    pub async fn announce(&self, text: &str, priority: AnnouncePriority) {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::warn!("Cannot announce while disconnected");
            return;
        }
        match priority {
            AnnouncePriority::Immediate => {
                if let Err(e) = self.send_announcement(text).await {
                    tracing::warn!(error = %e, "Failed to send announcement");
                }
            }
            AnnouncePriority::Queued => {
                if let Some(tx) = self.announcement_tx.lock().unwrap().as_ref() {
                    let _ = tx.send(text.to_string());
                }
            }
        }
    }

    async fn send_announcement(&self, text: &str) -> ModelResult<()> {
        self.send(ClientMessage::ClientContent {
            client_content: ClientContent {
                turns: vec![ContentBlock::user_text(&format!(
                    "[SYSTEM: Announce this to the user: {text}]"
                ))],
                turn_complete: true,
            },
        })
        .await
    }

    fn start_announcement_pump(&self) {
        self.stop_announcement_pump();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        *self.announcement_tx.lock().unwrap() = Some(tx);

        let session = self.weak.clone();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let Some(session) = session.upgrade() else { break };
                if session.connected.load(Ordering::SeqCst) {
                    if let Err(e) = session.send_announcement(&text).await {
                        tracing::warn!(error = %e, "Queued announcement failed");
                    }
                }
            }
        });
        *self.pump_task.lock().unwrap() = Some(task);
    }

    fn stop_announcement_pump(&self) {
        *self.announcement_tx.lock().unwrap() = None;
        if let Some(task) = self.pump_task.lock().unwrap().take() {
            task.abort();
        }
    }

    // ==================== Downstream ====================

    /// Consume server messages for one turn.
    ///
    /// Returns normally on turn completion. A turn-complete flag on the same
    /// message that carried a tool call does NOT end the turn; the model
    /// still owes a response to the tool results. Raises `ConnectionReset`
    /// on a go-away notice or an unexpected stream end.
    pub async fn process_responses<FA, FT>(
        &self,
        mut on_audio: FA,
        mut on_text: FT,
    ) -> ModelResult<()>
    where
        FA: FnMut(Vec<u8>) + Send,
        FT: FnMut(&str) + Send,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ModelError::NotConnected);
        }

        let mut stream_guard = self.stream.lock().await;
        let stream = stream_guard.as_mut().ok_or(ModelError::NotConnected)?;

        let mut phase = TurnPhase::Awaiting;
        note_phase(phase);
        let mut message_count = 0u64;

        loop {
            let msg = match stream.recv().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(ModelError::ConnectionReset(e.to_string()));
                }
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(if self.go_away.load(Ordering::SeqCst) {
                        ModelError::ConnectionReset(format!(
                            "session ended by go-away after {message_count} messages"
                        ))
                    } else {
                        ModelError::ConnectionReset(format!(
                            "session ended unexpectedly after {message_count} messages"
                        ))
                    });
                }
            };

            message_count += 1;
            *self.last_response_time.lock().unwrap() = Some(Instant::now());

            if let Some(go_away) = &msg.go_away {
                self.go_away.store(true, Ordering::SeqCst);
                tracing::warn!(time_left = ?go_away.time_left, "Server sent go-away notice");
            }

            if let Some(update) = &msg.session_resumption_update {
                if let Some(handle) = &update.new_handle {
                    *self.session_handle.lock().unwrap() = Some(handle.clone());
                    tracing::debug!("Session resumption handle updated");
                }
            }

            let mut handled_tool_call = false;
            if let Some(tool_call) = &msg.tool_call {
                phase = TurnPhase::ReceivingToolCall;
                note_phase(phase);
                self.handle_tool_calls(tool_call).await;
                phase = TurnPhase::SendingToolResponse;
                note_phase(phase);
                handled_tool_call = true;
            }

            if let Some(content) = &msg.server_content {
                if let Some(transcription) = &content.input_transcription {
                    if !transcription.text.is_empty() {
                        self.session_state.set_last_user_transcript(&transcription.text);
                        self.logger.log_user_speech(&transcription.text);
                    }
                }

                if content.interrupted {
                    tracing::info!("User interrupted; stopping playback");
                    self.audio.stop_playback();
                }

                if let Some(model_turn) = &content.model_turn {
                    for part in &model_turn.parts {
                        if let Some(inline) = &part.inline_data {
                            if inline.is_audio() {
                                if let Some(pcm) = inline.decode() {
                                    phase = TurnPhase::ReadingAudio;
                                    note_phase(phase);
                                    self.generating.store(true, Ordering::SeqCst);
                                    on_audio(pcm);
                                }
                            }
                        }
                        if let Some(text) = &part.text {
                            if !text.is_empty() {
                                phase = TurnPhase::ReadingText;
                                note_phase(phase);
                                self.logger.log_assistant_response(text);
                                on_text(text);
                            }
                        }
                    }
                }

                if content.turn_complete {
                    self.generating.store(false, Ordering::SeqCst);
                    *self.last_turn_complete.lock().unwrap() = Some(Instant::now());

                    if handled_tool_call {
                        // The model still owes a response to the tool
                        // results; keep consuming.
                        tracing::debug!("Turn-complete on tool-call message; turn continues");
                        phase = TurnPhase::Awaiting;
                        note_phase(phase);
                    } else {
                        phase = TurnPhase::TurnComplete;
                        tracing::debug!(messages = message_count, phase = ?phase, "Turn complete");
                        return Ok(());
                    }
                }
            }

            if message_count == 1 && msg.setup_complete.is_some() {
                tracing::debug!("Session setup complete");
            }
        }
    }

    /// Dispatch every call in the group, execute side effects, and send all
    /// function responses as one batch.
    async fn handle_tool_calls(&self, tool_call: &wire::ToolCallFrame) {
        self.in_tool_call.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let names: Vec<&str> = tool_call.function_calls.iter().map(|c| c.name.as_str()).collect();
        tracing::info!(calls = ?names, "Dispatching tool calls");

        let mut responses = Vec::with_capacity(tool_call.function_calls.len());
        for call in &tool_call.function_calls {
            let response = self.dispatcher.dispatch(&call.name, call.args.clone()).await;

            if let Some(feedback) = &response.voice_feedback {
                self.announce(feedback, AnnouncePriority::Queued).await;
            }
            if response.start_ambient {
                self.dispatcher.ambient().start_work_music();
            } else if response.stop_ambient {
                self.dispatcher.ambient().stop_work_music();
            }

            responses.push(FunctionResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                response: response.result,
            });
        }

        let batch = ClientMessage::ToolResponse {
            tool_response: ToolResponseFrame { function_responses: responses },
        };
        if let Err(e) = self.send(batch).await {
            tracing::error!(error = %e, "Failed to send tool responses");
        }

        tracing::info!(
            count = tool_call.function_calls.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Tool call batch complete"
        );
        self.in_tool_call.store(false, Ordering::SeqCst);
    }
}

fn note_phase(phase: TurnPhase) {
    tracing::trace!(?phase, "turn phase");
}

/// Backoff schedule: base 1 s, factor 2, capped at 30 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let delay = RECONNECT_BASE_DELAY * 2u32.saturating_pow(exp);
    delay.min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioResult;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    #[test]
    fn test_reconnect_delay_schedule() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), Duration::from_secs(30));
        assert_eq!(reconnect_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_cumulative_delay_bounded() {
        let total: Duration = (1..=MAX_RECONNECT_ATTEMPTS).map(reconnect_delay).sum();
        // 1 + 2 + 4 seconds for the default policy.
        assert_eq!(total, Duration::from_secs(7));
    }

    // ==================== Scripted transport ====================

    struct ScriptedConnector {
        frames: Mutex<VecDeque<Value>>,
        sent: Arc<Mutex<Vec<Value>>>,
    }

    impl ScriptedConnector {
        fn new(frames: Vec<Value>) -> (Box<Self>, Arc<Mutex<Vec<Value>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(Self {
                    frames: Mutex::new(frames.into_iter().collect()),
                    sent: sent.clone(),
                }),
                sent,
            )
        }
    }

    #[async_trait]
    impl ModelConnector for ScriptedConnector {
        async fn connect(
            &self,
        ) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>), ModelError> {
            let frames = std::mem::take(&mut *self.frames.lock().unwrap());
            Ok((
                Box::new(RecordingSink { sent: self.sent.clone() }),
                Box::new(ScriptedStream { frames }),
            ))
        }
    }

    struct RecordingSink {
        sent: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl TransportSink for RecordingSink {
        async fn send(&mut self, msg: ClientMessage) -> Result<(), ModelError> {
            self.sent.lock().unwrap().push(serde_json::to_value(&msg).unwrap());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct ScriptedStream {
        frames: VecDeque<Value>,
    }

    #[async_trait]
    impl TransportStream for ScriptedStream {
        async fn recv(&mut self) -> Option<Result<wire::ServerMessage, ModelError>> {
            let frame = self.frames.pop_front()?;
            Some(serde_json::from_value(frame).map_err(|e| ModelError::Transport(e.to_string())))
        }
    }

    struct SilentAudio;

    #[async_trait]
    impl AudioSource for SilentAudio {
        async fn start(&self) -> AudioResult<()> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn next_frame(&self) -> Option<Vec<u8>> {
            None
        }
        fn play(&self, _pcm: Vec<u8>) {}
        fn stop_playback(&self) {}
        fn is_playback_complete(&self) -> bool {
            true
        }
    }

    fn scripted_session(frames: Vec<Value>) -> (Arc<ModelSession>, Arc<Mutex<Vec<Value>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::store::EventStore::open_in_memory().unwrap();
        let workspace = dir.path().join(".parley");
        let dispatcher = ToolDispatcher::new(
            store.clone(),
            Arc::new(crate::prompts::PromptManager::new(workspace.clone(), Some(store))),
            Arc::new(crate::subagent::SubagentClient::new("http://localhost:1")),
            Arc::new(crate::builder::BuilderRegistry::new()),
            Arc::new(SessionState::new()),
            Arc::new(crate::config::ParleyConfig::default()),
            Arc::new(crate::audio::AmbientAudioController::new()),
            Arc::new(ConversationLogger::new()),
            workspace,
        );

        let (connector, sent) = ScriptedConnector::new(frames);
        let session = ModelSession::new(
            connector,
            "models/test",
            "system prompt",
            dispatcher,
            Arc::new(SilentAudio),
            Arc::new(SessionState::new()),
            Arc::new(ConversationLogger::new()),
        );
        (session, sent, dir)
    }

    #[tokio::test]
    async fn test_turn_complete_on_tool_call_message_does_not_end_turn() {
        // First frame carries both a tool call and turn_complete; the turn
        // must continue until the second frame's turn_complete.
        let frames = vec![
            json!({
                "tool_call": {"function_calls": [{"id": "c1", "name": "check_status", "args": {}}]},
                "server_content": {"turn_complete": true}
            }),
            json!({
                "server_content": {
                    "model_turn": {"parts": [{"text": "All quiet."}]},
                    "turn_complete": true
                }
            }),
        ];
        let (session, sent, _dir) = scripted_session(frames);
        session.connect(Vec::new(), None).await.unwrap();

        let mut texts = Vec::new();
        session
            .process_responses(|_pcm| {}, |text| texts.push(text.to_string()))
            .await
            .unwrap();

        // The second frame was consumed, so its text arrived.
        assert_eq!(texts, vec!["All quiet."]);

        // One batched tool response went out (after the setup frame).
        let sent = sent.lock().unwrap();
        let tool_responses: Vec<_> =
            sent.iter().filter(|m| m.get("tool_response").is_some()).collect();
        assert_eq!(tool_responses.len(), 1);
        let responses = tool_responses[0]["tool_response"]["function_responses"]
            .as_array()
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["name"], "check_status");
    }

    #[tokio::test]
    async fn test_go_away_then_stream_end_raises_reset() {
        let frames = vec![json!({"go_away": {"time_left": "10s"}})];
        let (session, _sent, _dir) = scripted_session(frames);
        session.connect(Vec::new(), None).await.unwrap();

        let err = session.process_responses(|_| {}, |_| {}).await.unwrap_err();
        match err {
            ModelError::ConnectionReset(reason) => assert!(reason.contains("go-away"), "{reason}"),
            other => panic!("expected ConnectionReset, got {other:?}"),
        }
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_resumption_handle_recorded() {
        let frames = vec![
            json!({"session_resumption_update": {"new_handle": "handle-7", "resumable": true}}),
            json!({"server_content": {"turn_complete": true}}),
        ];
        let (session, _sent, _dir) = scripted_session(frames);
        session.connect(Vec::new(), None).await.unwrap();

        session.process_responses(|_| {}, |_| {}).await.unwrap();
        assert_eq!(session.session_handle().as_deref(), Some("handle-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_with_stored_handle() {
        let frames = vec![
            json!({"session_resumption_update": {"new_handle": "h-1", "resumable": true}}),
            json!({"go_away": {}}),
        ];
        let (session, sent, _dir) = scripted_session(frames);
        session.connect(Vec::new(), None).await.unwrap();

        let err = session.process_responses(|_| {}, |_| {}).await.unwrap_err();
        assert!(matches!(err, ModelError::ConnectionReset(_)));
        assert!(!session.is_connected());
        assert!(session.can_reconnect());

        assert!(session.reconnect().await);
        assert!(session.is_connected());
        assert_eq!(session.session_handle().as_deref(), Some("h-1"));

        // The reconnect's setup frame carried the stored handle.
        let sent = sent.lock().unwrap();
        let setups: Vec<_> = sent.iter().filter(|m| m.get("setup").is_some()).collect();
        assert_eq!(setups.len(), 2);
        assert_eq!(setups[1]["setup"]["session_resumption"]["handle"], "h-1");
    }

    #[tokio::test]
    async fn test_interrupted_flag_stops_playback_and_send_requires_connection() {
        let frames = vec![json!({
            "server_content": {"interrupted": true, "turn_complete": true}
        })];
        let (session, _sent, _dir) = scripted_session(frames);

        // Not connected yet: upstream sends fail fast.
        assert!(matches!(session.send_text("hi").await, Err(ModelError::NotConnected)));

        session.connect(Vec::new(), None).await.unwrap();
        session.process_responses(|_| {}, |_| {}).await.unwrap();
        assert!(session.time_since_turn_complete().is_some());
    }
}
