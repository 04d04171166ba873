//! Parley - voice-first development assistant orchestrator
//!
//! A duplex audio session against a conversational speech model drives a
//! tool surface that plans with subagents, dispatches work to builder
//! processes, and reports back through voice announcements and a realtime
//! dashboard.

mod audio;
mod builder;
mod config;
mod dashboard;
mod model;
mod monitor;
mod prompts;
mod relay;
mod sse;
mod store;
mod subagent;
mod supervisor;
mod tools;
mod voice_text;

use audio::{frame_rms, AmbientAudioController, AudioSource, LocalAudioSource};
use builder::{BuilderClient, BuilderRegistry};
use clap::Parser;
use config::ParleyConfig;
use dashboard::{AppState, ConnectionManager, ConversationLogger};
use model::{AnnouncePriority, ModelError, ModelSession, WsConnector};
use monitor::BuildMonitor;
use relay::{AnnouncementKind, SessionState};
use sse::SessionAggregator;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::EventStore;
use subagent::SubagentClient;
use supervisor::{ProcessSupervisor, SupervisorConfig};
use tools::ToolDispatcher;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Speech-model WebSocket endpoint; overridable for gateways and tests.
const DEFAULT_SPEECH_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
const DEFAULT_SPEECH_MODEL: &str = "models/gemini-2.0-flash-exp";

const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, a voice-first development assistant. \
Have natural conversations with developers about their code. When they describe problems \
or tasks, help them refine their ideas. Be concise - this is voice, not text.";

/// Audio frames of silence (~1 s) after speech before signaling stream end.
const SILENCE_FRAMES_THRESHOLD: u32 = 10;
/// Safe-point tick and debounce.
const SAFE_POINT_TICK: Duration = Duration::from_millis(100);
const TURN_COMPLETE_DEBOUNCE: Duration = Duration::from_millis(200);
/// How long to let playback drain between turns.
const PLAYBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Voice-first development assistant", version)]
struct Cli {
    /// Voice input source.
    #[arg(long, default_value = "local", value_parser = ["local", "discord", "telegram"])]
    source: String,

    /// Subagent orchestration server URL (default: from config).
    #[arg(long)]
    opencode_url: Option<String>,

    /// Path to the config file.
    #[arg(long, default_value = ".parley/config.yaml")]
    config: String,

    /// Dashboard server port.
    #[arg(long, default_value_t = 8080)]
    dashboard_port: u16,

    /// Discord bot token (required for --source discord).
    #[arg(long, env = "DISCORD_BOT_TOKEN")]
    discord_token: Option<String>,

    /// Telegram bot token (required for --source telegram).
    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    telegram_token: Option<String>,
}

fn fatal(message: &str) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}

/// Locate the workspace (`.parley/`) by walking up from the config path or
/// the current directory.
fn find_workspace(config_path: &str) -> (PathBuf, String) {
    let direct = PathBuf::from(config_path);
    if direct.exists() {
        let workspace = direct.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".parley"));
        return (workspace, config_path.to_string());
    }

    let mut dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    loop {
        let candidate = dir.join(".parley").join("config.yaml");
        if candidate.exists() {
            return (dir.join(".parley"), candidate.display().to_string());
        }
        if !dir.pop() {
            break;
        }
    }

    tracing::warn!("No config file found, using defaults");
    (PathBuf::from(".parley"), config_path.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,tower_http=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let api_key = match std::env::var("GOOGLE_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => fatal("GOOGLE_API_KEY environment variable not set"),
    };

    let (workspace, config_path) = find_workspace(&cli.config);
    let config = Arc::new(ParleyConfig::load(&config_path));
    tracing::info!(
        workspace = %workspace.display(),
        root_project_dir = %config.root_project_dir,
        builders = ?config.builders.keys().collect::<Vec<_>>(),
        "Configuration loaded"
    );

    // The orchestration layer hosts the subagents; without it the session
    // has no brains, so failure to start is fatal.
    let orchestration = Arc::new(ProcessSupervisor::new(SupervisorConfig {
        role: "orchestration".to_string(),
        program: "opencode".to_string(),
        port: config.orchestration_port,
        working_dir: workspace.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        start_timeout: Duration::from_secs_f64(config.orchestration_start_timeout_secs),
        config_dir: Some(PathBuf::from(&config.orchestration_config_dir)),
        agents_source: Some(workspace.join("agents")),
        pid_file: workspace.join("cache").join("orchestration.pid"),
    }));

    if orchestration.health_check().await {
        tracing::info!(port = config.orchestration_port, "Orchestration layer already running");
    } else if config.orchestration_auto_start {
        tracing::info!(port = config.orchestration_port, "Starting orchestration layer");
        if let Err(e) = orchestration.start().await {
            fatal(&format!(
                "Failed to start the subagent orchestration layer: {e}. \
                 The subagents (planner, context-reader) are required. \
                 Check port {} and that the server binary is installed.",
                config.orchestration_port
            ));
        }
    } else {
        fatal(&format!(
            "Orchestration layer is not running on port {} and auto-start is disabled",
            config.orchestration_port
        ));
    }

    // Audio source. Chat-platform bridges are separate processes feeding the
    // same interface; this binary only ships the local device source.
    let voice: Arc<dyn AudioSource> = match cli.source.as_str() {
        "local" => Arc::new(LocalAudioSource::new()),
        other => fatal(&format!(
            "Voice source '{other}' requires the platform bridge process; only 'local' is built in"
        )),
    };
    if let Err(e) = voice.start().await {
        fatal(&format!("Failed to start audio: {e}"));
    }

    // Core shared state.
    let store = match EventStore::open(workspace.join("state.sqlite")) {
        Ok(store) => store,
        Err(e) => fatal(&format!("Failed to open state store: {e}")),
    };
    let session_state = Arc::new(SessionState::new());
    let ambient = Arc::new(AmbientAudioController::new());
    let logger = Arc::new(ConversationLogger::new());
    let ws = Arc::new(ConnectionManager::new());
    let aggregator = Arc::new(SessionAggregator::new(ws.clone()));
    let prompts = Arc::new(prompts::PromptManager::new(workspace.clone(), Some(store.clone())));

    let opencode_url = cli.opencode_url.clone().unwrap_or_else(|| config.orchestration_url());
    let subagent = Arc::new(SubagentClient::new(&opencode_url));

    // Activity feed: subagent client events go straight to the dashboard.
    let ws_for_activity = ws.clone();
    subagent.set_activity_callback(Arc::new(move |event| {
        ws_for_activity.broadcast(
            "activity",
            serde_json::json!({
                "agent": event.agent,
                "action": event.action,
                "message": event.message,
                "detail": event.detail,
            }),
        );
    }));

    let builders = Arc::new(BuilderRegistry::new());
    for (name, builder_config) in &config.builders {
        // Only opencode builders expose an HTTP server we can drive.
        if builder_config.r#type != "opencode" {
            continue;
        }
        builders.register(
            name,
            Arc::new(BuilderClient::new(
                name,
                &format!("http://localhost:{}", builder_config.port),
                &builder_config.model,
            )),
        );
    }

    let dispatcher = ToolDispatcher::new(
        store.clone(),
        prompts.clone(),
        subagent.clone(),
        builders.clone(),
        session_state.clone(),
        config.clone(),
        ambient.clone(),
        logger.clone(),
        workspace.clone(),
    );

    // Model session.
    let endpoint = std::env::var("PARLEY_SPEECH_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_SPEECH_ENDPOINT.to_string());
    let system_prompt = std::fs::read_to_string(&config.voice_system_prompt)
        .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());
    let session = ModelSession::new(
        Box::new(WsConnector::new(endpoint, api_key)),
        DEFAULT_SPEECH_MODEL,
        system_prompt,
        dispatcher.clone(),
        voice.clone(),
        session_state.clone(),
        logger.clone(),
    );

    if let Err(e) = session.connect(tools::tool_declarations(), None).await {
        fatal(&format!("Failed to connect to the speech model: {e}"));
    }
    tracing::info!("Connected to speech model");

    // One task per voice session; tool handlers refine it from there.
    let working_path = workspace.join("prompts").join("current").join("working.md");
    let working_path_str = working_path.to_string_lossy().to_string();
    match store.create_task("Voice Session", Some(&working_path_str), None) {
        Ok(task) => {
            if let Err(e) = prompts.init_working_prompt(&task.task_id, "Voice Session") {
                tracing::warn!(error = %e, "Failed to init working prompt");
            }
            dispatcher.set_current_task(Some(task.task_id.clone()));
            tracing::info!(task_id = %task.task_id.chars().take(8).collect::<String>(), "Session task created");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to create session task"),
    }

    // Live session events from the orchestration layer.
    aggregator.add_source("orchestration", &opencode_url).await;

    // Dashboard server.
    let app_state = AppState::new(
        store.clone(),
        logger.clone(),
        ws.clone(),
        aggregator.clone(),
        builders.clone(),
        session_state.clone(),
        config.clone(),
    );
    let app = dashboard::create_router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.dashboard_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => fatal(&format!("Failed to bind dashboard port {}: {e}", cli.dashboard_port)),
    };
    tracing::info!(%addr, "Dashboard listening");

    // Completion notifications: turn off the music, tell the user.
    let ambient_for_monitor = ambient.clone();
    let state_for_monitor = session_state.clone();
    let monitor = BuildMonitor::new(store.clone(), builders.clone(), monitor::DEFAULT_INTERVAL)
        .with_ws(ws.clone())
        .with_completion_callback(Box::new(move |_task_id, status, title| {
            ambient_for_monitor.stop_work_music();
            state_for_monitor.enqueue_announcement(
                &format!("The task '{title}' {status}."),
                if status == "completed" {
                    AnnouncementKind::Info
                } else {
                    AnnouncementKind::Error
                },
                None,
            );
        }));

    tracing::info!("Parley ready. Start speaking.");

    // All critical loops run concurrently; any one exiting is fatal.
    let result: Result<(), String> = tokio::select! {
        r = audio_send_loop(voice.clone(), session.clone(), config.voice_speech_threshold) => {
            Err(r.err().unwrap_or_else(|| "audio-send loop exited".to_string()))
        }
        r = response_process_loop(voice.clone(), session.clone()) => {
            Err(r.err().unwrap_or_else(|| "response-process loop exited".to_string()))
        }
        _ = relay_safe_point_loop(voice.clone(), session.clone(), session_state.clone(), ambient.clone()) => {
            Err("relay safe-point loop exited".to_string())
        }
        r = axum::serve(listener, app) => {
            Err(r.err().map(|e| e.to_string()).unwrap_or_else(|| "dashboard server exited".to_string()))
        }
        _ = monitor.run() => {
            Err("monitor loop exited".to_string())
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    };

    // Teardown in reverse order of acquisition.
    ambient.stop_work_music();
    session.disconnect().await;
    voice.stop().await;
    aggregator.stop_all().await;
    orchestration.stop().await;

    match result {
        Ok(()) => Ok(()),
        Err(message) => {
            tracing::error!(error = %message, "Fatal: critical loop exited");
            std::process::exit(1);
        }
    }
}

/// Drain mic frames, classify speech by RMS, and forward to the model.
///
/// After ~1 s of silence following speech, an explicit audio-end nudges the
/// server-side VAD. While the model is generating, the threshold triples so
/// playback echo doesn't read as speech. Send failures while disconnected
/// trigger a reconnect instead of killing the loop.
async fn audio_send_loop(
    voice: Arc<dyn AudioSource>,
    session: Arc<ModelSession>,
    speech_threshold: f32,
) -> Result<(), String> {
    let mut frame_count: u64 = 0;
    let mut last_speech_frame: u64 = 0;
    let mut audio_end_sent = false;
    let mut consecutive_errors = 0u32;

    tracing::info!(speech_threshold, "Audio send loop starting");

    while let Some(frame) = voice.next_frame().await {
        let rms = frame_rms(&frame);
        let effective_threshold = if session.is_generating() {
            speech_threshold * 3.0
        } else {
            speech_threshold
        };
        let is_speech = rms > effective_threshold;

        match session.send_audio(&frame).await {
            Ok(()) => {
                frame_count += 1;
                consecutive_errors = 0;

                if is_speech {
                    last_speech_frame = frame_count;
                    audio_end_sent = false;
                } else if last_speech_frame > 0 && !audio_end_sent {
                    let silent_frames = frame_count - last_speech_frame;
                    if silent_frames == u64::from(SILENCE_FRAMES_THRESHOLD) {
                        match session.send_audio_end().await {
                            Ok(()) => {
                                audio_end_sent = true;
                                tracing::debug!(silent_frames, "Sent audio-end signal");
                            }
                            Err(e) => tracing::warn!(error = %e, "Failed to send audio-end"),
                        }
                    }
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(error = %e, frame = frame_count, "Audio send failed");

                // A dropped connection must not stop mic forwarding for
                // good; ask for a reconnect and keep going.
                if !session.is_connected() {
                    if session.can_reconnect() {
                        let _ = session.reconnect().await;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    consecutive_errors = 0;
                    continue;
                }

                if consecutive_errors >= 5 {
                    tracing::warn!(consecutive_errors, "Too many audio errors; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    consecutive_errors = 0;
                }
            }
        }
    }

    Err(format!("audio source ended after {frame_count} frames"))
}

/// Run model turns back to back, draining playback between them and
/// reconnecting on connection resets.
async fn response_process_loop(
    voice: Arc<dyn AudioSource>,
    session: Arc<ModelSession>,
) -> Result<(), String> {
    let mut turn_count: u64 = 0;

    loop {
        turn_count += 1;
        tracing::debug!(turn = turn_count, "Waiting for model responses");

        let voice_for_playback = voice.clone();
        let result = session
            .process_responses(move |pcm| voice_for_playback.play(pcm), |_text| {})
            .await;

        match result {
            Ok(()) => {
                // Let playback finish before the next turn so the mic does
                // not pick up our own audio and trigger a false interrupt.
                if !voice.wait_for_playback_complete(PLAYBACK_DRAIN_TIMEOUT).await {
                    tracing::warn!("Playback drain timed out; continuing");
                }
                tracing::debug!(turn = turn_count, "Turn complete");
            }
            Err(ModelError::ConnectionReset(reason)) => {
                tracing::warn!(turn = turn_count, reason, "Connection lost");
                let mut reconnected = false;
                while session.can_reconnect() {
                    if session.reconnect().await {
                        reconnected = true;
                        break;
                    }
                }
                if !reconnected {
                    return Err("reconnection failed after all attempts".to_string());
                }
            }
            Err(e) => return Err(format!("response processing failed: {e}")),
        }
    }
}

/// Deliver queued announcements at safe points and keep ambient audio in
/// step with the waiting-thread set.
///
/// The safe-point predicate: connected, model not generating, no tool call
/// in flight, playback drained, and a small debounce after the latest
/// turn completion.
async fn relay_safe_point_loop(
    voice: Arc<dyn AudioSource>,
    session: Arc<ModelSession>,
    state: Arc<SessionState>,
    ambient: Arc<AmbientAudioController>,
) {
    loop {
        tokio::time::sleep(SAFE_POINT_TICK).await;

        if !session.is_connected() {
            continue;
        }
        if session.is_generating() || session.is_in_tool_call() {
            continue;
        }
        if !voice.is_playback_complete() {
            continue;
        }
        let Some(since_turn) = session.time_since_turn_complete() else {
            continue;
        };
        if since_turn < TURN_COMPLETE_DEBOUNCE {
            continue;
        }

        // At most one announcement per tick, and never over the music.
        if let Some(pending) = state.pop_announcement() {
            if ambient.is_playing() {
                ambient.stop_work_music();
            }
            session.announce(&pending.text, AnnouncePriority::Immediate).await;
            if pending.kind == AnnouncementKind::WaitStarted {
                state.set_preamble_delivered();
            }
            continue;
        }

        // Waiting music: on while work is pending (and the preamble has
        // been spoken), off when nothing is waiting.
        if state.has_waiting_threads() {
            if state.waiting_music_preamble_delivered() && !ambient.is_playing() {
                ambient.start_work_music();
            }
        } else if ambient.is_playing() {
            ambient.stop_work_music();
        }
    }
}
