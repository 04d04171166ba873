//! Live session-event aggregation from subagent/builder servers.
//!
//! Each server gets one `SessionEventSource` that prefers an SSE stream and
//! degrades to polling `/session` when the stream keeps failing. Session and
//! message metadata is tracked so streaming deltas can be computed, and
//! everything is broadcast to the dashboard.

use crate::dashboard::ConnectionManager;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_SSE_FAILURES: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Where a session originated, derived from its agent/title prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Conversator,
    Builder,
    External,
}

impl SessionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionOrigin::Conversator => "conversator",
            SessionOrigin::Builder => "builder",
            SessionOrigin::External => "external",
        }
    }

    /// `cvtr-*` agents belong to the orchestration layer; `build`/`builder`
    /// agents to a builder; everything else is external.
    pub fn classify(agent_name: &str) -> Self {
        if agent_name.starts_with("cvtr-") {
            SessionOrigin::Conversator
        } else if agent_name == "build" || agent_name == "builder" {
            SessionOrigin::Builder
        } else {
            SessionOrigin::External
        }
    }
}

/// Tracked metadata for one remote session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub agent_name: String,
    pub status: String,
    pub origin: SessionOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl SessionMeta {
    pub fn to_json(&self) -> Value {
        json!({
            "session_id": self.session_id,
            "agent_name": self.agent_name,
            "status": self.status,
            "source": self.origin.as_str(),
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
            "message_count": self.message_count,
        })
    }
}

/// Tracked metadata for one message inside a session.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub message_id: String,
    pub role: String,
    /// Length of content already broadcast; deltas never rewind past this.
    pub broadcast_len: usize,
    pub is_complete: bool,
}

#[derive(Default)]
struct SourceState {
    sessions: HashMap<String, SessionMeta>,
    messages: HashMap<String, HashMap<String, MessageMeta>>,
}

/// One subagent/builder server being watched.
pub struct SessionEventSource {
    name: String,
    base_url: String,
    ws: Arc<ConnectionManager>,
    state: Mutex<SourceState>,
    running: AtomicBool,
    sse_failures: AtomicU32,
    polling_mode: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionEventSource {
    pub fn new(name: &str, base_url: &str, ws: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ws,
            state: Mutex::new(SourceState::default()),
            running: AtomicBool::new(false),
            sse_failures: AtomicU32::new(0),
            polling_mode: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_status(&self) -> Value {
        json!({
            "running": self.running.load(Ordering::SeqCst),
            "mode": if self.polling_mode.load(Ordering::SeqCst) { "polling" } else { "sse" },
            "sse_failures": self.sse_failures.load(Ordering::SeqCst),
            "session_count": self.state.lock().unwrap().sessions.len(),
            "base_url": self.base_url,
        })
    }

    pub fn sessions(&self) -> Vec<SessionMeta> {
        self.state.lock().unwrap().sessions.values().cloned().collect()
    }

    /// Start watching: pre-load existing sessions (best effort), then run
    /// the SSE/poll loop in the background.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.fetch_all_sessions().await {
            Ok(count) if count > 0 => {
                tracing::info!(source = %self.name, count, "Pre-loaded existing sessions")
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(source = %self.name, error = %e, "Could not pre-fetch sessions")
            }
        }

        let source = self.clone();
        let task = tokio::spawn(async move { source.listen_loop().await });
        *self.task.lock().unwrap() = Some(task);
        tracing::info!(source = %self.name, url = %self.base_url, "Session event source started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn listen_loop(self: Arc<Self>) {
        let mut reconnect_delay = RECONNECT_BASE_DELAY;

        while self.running.load(Ordering::SeqCst) {
            if self.polling_mode.load(Ordering::SeqCst) {
                if let Err(e) = self.fetch_all_sessions().await {
                    tracing::debug!(source = %self.name, error = %e, "Polling error");
                }

                // Ease back toward SSE: each successful poll tick decays the
                // failure counter, and at zero we try the stream again.
                let failures = self.sse_failures.load(Ordering::SeqCst).saturating_sub(1);
                self.sse_failures.store(failures, Ordering::SeqCst);
                if failures == 0 {
                    tracing::info!(source = %self.name, "Retrying SSE connection");
                    self.polling_mode.store(false, Ordering::SeqCst);
                    reconnect_delay = RECONNECT_BASE_DELAY;
                }

                tokio::time::sleep(POLL_INTERVAL).await;
            } else {
                match self.listen_sse().await {
                    Ok(()) => {
                        self.sse_failures.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        let failures = self.sse_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::warn!(
                            source = %self.name,
                            failures,
                            max = MAX_SSE_FAILURES,
                            error = %e,
                            "SSE connection error"
                        );

                        if failures >= MAX_SSE_FAILURES {
                            tracing::warn!(source = %self.name, "Switching to polling mode");
                            self.polling_mode.store(true, Ordering::SeqCst);
                            continue;
                        }

                        tokio::time::sleep(reconnect_delay).await;
                        reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
        }
    }

    /// Try candidate SSE endpoints in order; the first that answers with
    /// `text/event-stream` wins.
    async fn listen_sse(&self) -> Result<(), String> {
        let candidates = [
            format!("{}/event", self.base_url),
            format!("{}/global/event", self.base_url),
            format!("{}/event/subscribe", self.base_url),
            format!("{}/api/event/subscribe", self.base_url),
        ];

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| e.to_string())?;

        let mut last_error = String::from("no endpoint answered");

        for url in &candidates {
            let response = match client
                .get(url)
                .header("Accept", "text/event-stream")
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            if !response.status().is_success() {
                tracing::debug!(url = %url, status = %response.status(), "SSE candidate rejected");
                continue;
            }
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.contains("text/event-stream") {
                tracing::debug!(url = %url, content_type, "SSE candidate is not an event stream");
                continue;
            }

            tracing::info!(source = %self.name, url = %url, "Connected to SSE stream");

            let mut stream = response.bytes_stream();
            let mut parser = SseFrameParser::default();

            while let Some(chunk) = stream.next().await {
                if !self.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let chunk = chunk.map_err(|e| e.to_string())?;
                for (event_type, data) in parser.push(&chunk) {
                    self.handle_event(&event_type, data);
                }
            }

            last_error = "SSE stream ended".to_string();
        }

        Err(last_error)
    }

    /// Route one SSE event. The `type` field inside the payload wins over
    /// the `event:` header; unknown events are ignored.
    fn handle_event(&self, event_type: &str, data: Value) {
        let resolved = data
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or(event_type)
            .to_string();

        match resolved.as_str() {
            "session.updated" | "session.status" => self.on_session_updated(&data),
            "message.updated" => self.on_message_updated(&data),
            "message.part.updated" | "message.part" | "message.delta" => {
                self.on_message_part_updated(&data)
            }
            "permission.updated" => self.on_permission_updated(&data),
            "session.error" | "session.status.error" => self.on_session_error(&data),
            other => tracing::debug!(source = %self.name, event = other, "Unhandled SSE event"),
        }
    }

    fn on_session_updated(&self, data: &Value) {
        let properties = data.get("properties").unwrap_or(data);
        let info = properties.get("info").filter(|i| i.is_object()).unwrap_or(properties);

        let Some(session_id) = extract_session_id(info, properties) else {
            return;
        };

        let title = info
            .get("title")
            .or_else(|| properties.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or("");
        let mut agent_name = info
            .get("agent")
            .or_else(|| properties.get("agent"))
            .and_then(|a| a.as_str())
            .unwrap_or("unknown")
            .to_string();
        if let Some(rest) = title.strip_prefix("Parley:") {
            agent_name = rest.trim().to_string();
        }
        let origin = SessionOrigin::classify(&agent_name);

        let status_type = match properties.get("status") {
            Some(Value::Object(obj)) => obj.get("type").and_then(|t| t.as_str()).map(String::from),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        let (created, snapshot) = {
            let mut state = self.state.lock().unwrap();
            match state.sessions.get_mut(&session_id) {
                Some(session) => {
                    session.updated_at = Utc::now();
                    if let Some(status) = status_type {
                        session.status = status;
                    }
                    (false, session.clone())
                }
                None => {
                    let session = SessionMeta {
                        session_id: session_id.clone(),
                        agent_name,
                        status: status_type.unwrap_or_else(|| "active".to_string()),
                        origin,
                        created_at: Utc::now(),
                        updated_at: Utc::now(),
                        message_count: 0,
                    };
                    state.sessions.insert(session_id.clone(), session.clone());
                    state.messages.entry(session_id.clone()).or_default();
                    (true, session)
                }
            }
        };

        if created {
            tracing::info!(
                source = %self.name,
                session = %truncate_id(&session_id),
                agent = %snapshot.agent_name,
                origin = snapshot.origin.as_str(),
                "New session tracked"
            );
            self.ws.broadcast("opencode_session_created", snapshot.to_json());
        } else {
            self.ws.broadcast(
                "opencode_session_updated",
                json!({
                    "session_id": session_id,
                    "status": snapshot.status,
                    "message_count": snapshot.message_count,
                    "updated_at": snapshot.updated_at.to_rfc3339(),
                }),
            );
        }
    }

    fn on_message_updated(&self, data: &Value) {
        let properties = data.get("properties").unwrap_or(data);
        let info = properties.get("info").filter(|i| i.is_object()).unwrap_or(properties);

        let Some(session_id) = extract_session_id(info, properties) else {
            return;
        };
        let Some(message_id) = extract_message_id(info, properties) else {
            return;
        };

        let role = info
            .get("role")
            .or_else(|| info.get("sender"))
            .or_else(|| properties.get("role"))
            .and_then(|r| r.as_str())
            .unwrap_or("unknown")
            .to_string();

        let content = aggregate_part_text(properties.get("parts"));

        let status = info.get("status").and_then(|s| s.as_str()).unwrap_or("");
        let is_complete = matches!(status, "done" | "complete" | "finished" | "success")
            || info.get("complete").and_then(|v| v.as_bool()) == Some(true)
            || info.get("finished").and_then(|v| v.as_bool()) == Some(true);

        let delta = {
            let mut state = self.state.lock().unwrap();
            let session_messages = state.messages.entry(session_id.clone()).or_default();

            let delta = match session_messages.get_mut(&message_id) {
                Some(meta) => {
                    let delta = compute_delta(meta.broadcast_len, &content);
                    if content.len() > meta.broadcast_len {
                        meta.broadcast_len = content.len();
                    }
                    meta.is_complete = is_complete;
                    delta
                }
                None => {
                    session_messages.insert(
                        message_id.clone(),
                        MessageMeta {
                            message_id: message_id.clone(),
                            role: role.clone(),
                            broadcast_len: content.len(),
                            is_complete,
                        },
                    );
                    // First sight of the message: its whole content is new.
                    if content.is_empty() { None } else { Some(content.clone()) }
                }
            };

            let message_count = session_messages.len();
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.message_count = message_count;
                if is_complete && role == "assistant" {
                    session.updated_at = Utc::now();
                    if session.status == "active" {
                        session.status = "completed".to_string();
                    }
                }
            }
            delta
        };

        if let Some(delta) = delta {
            self.ws.broadcast(
                "opencode_message_chunk",
                json!({
                    "session_id": session_id,
                    "message_id": message_id,
                    "content_delta": delta,
                    "is_complete": is_complete,
                }),
            );
        }
    }

    fn on_message_part_updated(&self, data: &Value) {
        let properties = data.get("properties").unwrap_or(data);

        let Some(session_id) = properties
            .get("sessionID")
            .or_else(|| properties.get("session_id"))
            .and_then(|v| v.as_str())
            .map(String::from)
        else {
            return;
        };

        let message_id = properties
            .get("messageID")
            .or_else(|| properties.get("message_id"))
            .or_else(|| properties.get("id"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("part_{}", &uuid::Uuid::new_v4().to_string()[..8]));

        let part = properties.get("part").cloned().unwrap_or(Value::Null);
        let delta = properties
            .get("delta")
            .or_else(|| part.get("delta"))
            .and_then(|d| d.as_str())
            .map(String::from);

        {
            let mut state = self.state.lock().unwrap();
            let session_messages = state.messages.entry(session_id.clone()).or_default();
            let meta = session_messages.entry(message_id.clone()).or_insert_with(|| MessageMeta {
                message_id: message_id.clone(),
                role: properties
                    .get("role")
                    .and_then(|r| r.as_str())
                    .unwrap_or("assistant")
                    .to_string(),
                broadcast_len: 0,
                is_complete: false,
            });
            if let Some(delta) = &delta {
                meta.broadcast_len += delta.len();
            }
        }

        if let Some(delta) = delta {
            self.ws.broadcast(
                "opencode_message_chunk",
                json!({
                    "session_id": session_id,
                    "message_id": message_id,
                    "content_delta": delta,
                    "is_complete": false,
                    "source_event": "message.part.updated",
                }),
            );
        }

        if part.get("type").and_then(|t| t.as_str()) == Some("tool") {
            self.ws.broadcast(
                "opencode_tool_updated",
                json!({
                    "session_id": session_id,
                    "message_id": message_id,
                    "tool": part.get("tool"),
                    "status": part.get("state").and_then(|s| s.get("status")),
                    "part": part,
                }),
            );
        }
    }

    fn on_permission_updated(&self, data: &Value) {
        let properties = data.get("properties").unwrap_or(data);
        self.ws.broadcast(
            "opencode_permission_updated",
            json!({
                "title": properties.get("title"),
                "permission": properties,
            }),
        );
    }

    fn on_session_error(&self, data: &Value) {
        let properties = data.get("properties").unwrap_or(data);
        let Some(session_id) = properties
            .get("sessionID")
            .or_else(|| properties.get("session_id"))
            .and_then(|v| v.as_str())
        else {
            return;
        };
        let error = properties.get("error").cloned().unwrap_or(json!("Unknown error"));

        let updated = {
            let mut state = self.state.lock().unwrap();
            match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.status = "error".to_string();
                    session.updated_at = Utc::now();
                    Some(session.updated_at)
                }
                None => None,
            }
        };

        if let Some(updated_at) = updated {
            tracing::error!(source = %self.name, session = %truncate_id(session_id), ?error, "Session error");
            self.ws.broadcast(
                "opencode_session_updated",
                json!({
                    "session_id": session_id,
                    "status": "error",
                    "error": error,
                    "updated_at": updated_at.to_rfc3339(),
                }),
            );
        }
    }

    /// Refresh the session list from the plain HTTP API.
    async fn fetch_all_sessions(&self) -> Result<usize, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| e.to_string())?;

        let response = client
            .get(format!("{}/session", self.base_url))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }

        let sessions: Vec<Value> = response.json().await.map_err(|e| e.to_string())?;
        let mut count = 0;

        let mut state = self.state.lock().unwrap();
        for raw in &sessions {
            let info = raw.get("info").filter(|i| i.is_object()).unwrap_or(raw);
            let Some(session_id) = info
                .get("id")
                .or_else(|| info.get("session_id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };

            let title = info.get("title").and_then(|t| t.as_str()).unwrap_or("");
            let mut agent_name = info
                .get("agent")
                .and_then(|a| a.as_str())
                .unwrap_or("unknown")
                .to_string();
            if let Some(rest) = title.strip_prefix("Parley:") {
                agent_name = rest.trim().to_string();
            }
            let origin = SessionOrigin::classify(&agent_name);

            state
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionMeta {
                    session_id: session_id.to_string(),
                    agent_name,
                    status: "active".to_string(),
                    origin,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                    message_count: 0,
                });
            count += 1;
        }

        Ok(count)
    }
}

// ==================== Aggregator ====================

/// Watches N servers and presents their sessions as one tagged list.
#[derive(Default)]
pub struct SessionAggregator {
    sources: Mutex<HashMap<String, Arc<SessionEventSource>>>,
    ws: Mutex<Option<Arc<ConnectionManager>>>,
}

impl SessionAggregator {
    pub fn new(ws: Arc<ConnectionManager>) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            ws: Mutex::new(Some(ws)),
        }
    }

    pub async fn add_source(&self, name: &str, base_url: &str) -> Arc<SessionEventSource> {
        let existing = { self.sources.lock().unwrap().get(name).cloned() };
        if let Some(existing) = existing {
            tracing::warn!(source = name, "Source already exists, replacing");
            existing.stop().await;
        }

        let ws = self
            .ws
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(ConnectionManager::new()));
        let source = SessionEventSource::new(name, base_url, ws.clone());
        self.sources.lock().unwrap().insert(name.to_string(), source.clone());
        source.clone().start().await;

        ws.broadcast("source_registered", json!({ "name": name, "base_url": base_url }));
        source
    }

    pub async fn remove_source(&self, name: &str) {
        let source = self.sources.lock().unwrap().remove(name);
        if let Some(source) = source {
            source.stop().await;
            if let Some(ws) = self.ws.lock().unwrap().clone() {
                ws.broadcast("source_deregistered", json!({ "name": name }));
            }
            tracing::info!(source = name, "Removed session event source");
        }
    }

    pub async fn stop_all(&self) {
        let sources: Vec<_> = self.sources.lock().unwrap().values().cloned().collect();
        for source in sources {
            source.stop().await;
        }
    }

    /// All sessions across all sources, tagged with their source name,
    /// newest update first.
    pub fn get_aggregated_sessions(&self) -> Vec<Value> {
        let sources = self.sources.lock().unwrap();
        let mut all: Vec<(DateTime<Utc>, Value)> = Vec::new();
        for (name, source) in sources.iter() {
            for session in source.sessions() {
                let mut tagged = session.to_json();
                tagged["instance"] = json!(name);
                all.push((session.updated_at, tagged));
            }
        }
        all.sort_by(|a, b| b.0.cmp(&a.0));
        all.into_iter().map(|(_, v)| v).collect()
    }

    pub fn connection_status(&self) -> Value {
        let sources = self.sources.lock().unwrap();
        let statuses: serde_json::Map<String, Value> = sources
            .iter()
            .map(|(name, source)| (name.clone(), source.connection_status()))
            .collect();
        let total: usize = sources.values().map(|s| s.sessions().len()).sum();
        json!({ "sources": statuses, "total_sessions": total })
    }
}

// ==================== SSE framing ====================

/// Incremental parser for `event:`/`data:` framed streams. Multi-line data
/// is concatenated; a blank line dispatches the pending event.
#[derive(Default)]
pub struct SseFrameParser {
    buffer: String,
    event_type: String,
    event_data: String,
}

impl SseFrameParser {
    /// Feed raw bytes; returns completed `(event_type, data)` pairs.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<(String, Value)> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut complete = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim();

            if let Some(rest) = line.strip_prefix("event:") {
                self.event_type = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                let chunk = rest.trim();
                if self.event_data.is_empty() {
                    self.event_data = chunk.to_string();
                } else {
                    self.event_data.push('\n');
                    self.event_data.push_str(chunk);
                }
            } else if line.is_empty() && !self.event_data.is_empty() {
                match serde_json::from_str::<Value>(&self.event_data) {
                    Ok(data) => complete.push((std::mem::take(&mut self.event_type), data)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to parse SSE data");
                        self.event_type.clear();
                    }
                }
                self.event_data.clear();
            }
        }

        complete
    }
}

/// Content delta since the last broadcast. Never rewinds: shorter content
/// than what was already broadcast yields nothing.
fn compute_delta(broadcast_len: usize, content: &str) -> Option<String> {
    if content.len() > broadcast_len {
        Some(content[broadcast_len..].to_string())
    } else {
        None
    }
}

fn aggregate_part_text(parts: Option<&Value>) -> String {
    parts
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| {
                    let is_text = part.get("type").and_then(|t| t.as_str()) == Some("text");
                    let text = part.get("text").and_then(|t| t.as_str());
                    // Some server payloads omit the explicit type.
                    if is_text || (part.get("type").is_none() && text.is_some()) {
                        text
                    } else {
                        None
                    }
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn extract_session_id(info: &Value, properties: &Value) -> Option<String> {
    info.get("id")
        .or_else(|| info.get("sessionID"))
        .or_else(|| info.get("session_id"))
        .or_else(|| properties.get("sessionID"))
        .or_else(|| properties.get("session_id"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn extract_message_id(info: &Value, properties: &Value) -> Option<String> {
    info.get("id")
        .or_else(|| info.get("messageID"))
        .or_else(|| info.get("message_id"))
        .or_else(|| properties.get("messageID"))
        .or_else(|| properties.get("message_id"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn truncate_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_classification() {
        assert_eq!(SessionOrigin::classify("cvtr-planner"), SessionOrigin::Conversator);
        assert_eq!(SessionOrigin::classify("build"), SessionOrigin::Builder);
        assert_eq!(SessionOrigin::classify("builder"), SessionOrigin::Builder);
        assert_eq!(SessionOrigin::classify("someone-else"), SessionOrigin::External);
    }

    #[test]
    fn test_sse_parser_frames() {
        let mut parser = SseFrameParser::default();
        let events = parser.push(b"event: session.updated\ndata: {\"a\": 1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "session.updated");
        assert_eq!(events[0].1["a"], 1);
    }

    #[test]
    fn test_sse_parser_split_across_chunks() {
        let mut parser = SseFrameParser::default();
        assert!(parser.push(b"event: message.upd").is_empty());
        assert!(parser.push(b"ated\ndata: {\"x\":").is_empty());
        let events = parser.push(b" 2}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "message.updated");
        assert_eq!(events[0].1["x"], 2);
    }

    #[test]
    fn test_sse_parser_multiline_data() {
        let mut parser = SseFrameParser::default();
        // Multi-line data lines are concatenated before parsing. Use a string
        // that only becomes valid JSON once joined.
        let events = parser.push(b"data: {\"a\":\ndata: 1}\n\n");
        // "{\"a\":\n1}" is valid JSON.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["a"], 1);
    }

    #[test]
    fn test_delta_concatenation_equals_final_text() {
        // Simulate a message streaming in over several updates.
        let snapshots = ["Hel", "Hello, ", "Hello, wor", "Hello, world!"];
        let mut broadcast_len = 0;
        let mut assembled = String::new();

        for snapshot in snapshots {
            if let Some(delta) = compute_delta(broadcast_len, snapshot) {
                assembled.push_str(&delta);
                broadcast_len = snapshot.len();
            }
        }
        assert_eq!(assembled, "Hello, world!");
    }

    #[test]
    fn test_delta_never_rewinds() {
        assert!(compute_delta(10, "short").is_none());
        assert!(compute_delta(5, "12345").is_none());
        assert_eq!(compute_delta(5, "1234567").unwrap(), "67");
    }

    #[test]
    fn test_aggregate_part_text_tolerates_missing_type() {
        let parts = serde_json::json!([
            {"type": "text", "text": "a"},
            {"text": "b"},
            {"type": "tool", "tool": "bash"},
        ]);
        assert_eq!(aggregate_part_text(Some(&parts)), "ab");
    }
}
