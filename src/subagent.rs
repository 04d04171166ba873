//! HTTP client for the subagent orchestration server.
//!
//! The server exposes `POST /session`, `POST /session/{id}/prompt_async`,
//! `GET /session/{id}/message`, and `GET /agent`. Responses are retrieved by
//! polling the message list: we snapshot the assistant messages that existed
//! before the prompt, then watch for the first new one and re-read its text
//! until the server signals completion (or the content stops changing).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hard cap on one poll cycle.
const POLL_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_MAX_INTERVAL: Duration = Duration::from_secs(2);
const POLL_BACKOFF_FACTOR: f64 = 1.2;
/// Fallback completion: content length stable for this many consecutive
/// polls while the server reports no status at all.
const STABLE_POLLS_FOR_COMPLETION: u32 = 12;

#[derive(Error, Debug)]
pub enum SubagentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Session creation returned no id")]
    NoSessionId,
}

pub type SubagentResult<T> = Result<T, SubagentError>;

/// Events yielded while waiting for a subagent reply.
#[derive(Debug, Clone)]
pub enum SubagentEvent {
    /// Assistant text observed (final content so far).
    Message { content: String },
    /// The reply finished.
    Complete { content: String, duration_ms: u64 },
    /// The request failed; the poll loop stops after this.
    Error { content: String },
}

/// Activity notifications for dashboards. Failures inside the callback are
/// the callback's problem.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub agent: String,
    pub action: &'static str,
    pub message: String,
    pub detail: Option<String>,
}

pub type ActivityCallback = Arc<dyn Fn(ActivityEvent) + Send + Sync>;

/// The subset of the subagent server the tool handlers need. The HTTP
/// client implements this; tests drive the handlers with a scripted one.
#[async_trait]
pub trait SubagentBackend: Send + Sync {
    async fn create_session(&self, title: &str) -> SubagentResult<String>;
    async fn engage(&self, agent: &str, message: &str) -> Vec<SubagentEvent>;
    async fn continue_session(&self, agent: &str, message: &str) -> Vec<SubagentEvent>;
    async fn send_to_session(&self, session_id: &str, agent: &str, message: &str) -> Vec<SubagentEvent>;
    async fn health_check(&self) -> bool;
    fn cached_session(&self, agent: &str) -> Option<String>;
}

#[async_trait]
impl SubagentBackend for SubagentClient {
    async fn create_session(&self, title: &str) -> SubagentResult<String> {
        SubagentClient::create_session(self, title).await
    }

    async fn engage(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
        SubagentClient::engage(self, agent, message).await
    }

    async fn continue_session(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
        SubagentClient::continue_session(self, agent, message).await
    }

    async fn send_to_session(&self, session_id: &str, agent: &str, message: &str) -> Vec<SubagentEvent> {
        SubagentClient::send_to_session(self, session_id, agent, message).await
    }

    async fn health_check(&self) -> bool {
        SubagentClient::health_check(self).await
    }

    fn cached_session(&self, agent: &str) -> Option<String> {
        SubagentClient::cached_session(self, agent)
    }
}

pub struct SubagentClient {
    base_url: String,
    client: reqwest::Client,
    active_sessions: Mutex<HashMap<String, String>>,
    activity_callback: Mutex<Option<ActivityCallback>>,
}

impl SubagentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("HTTP client construction cannot fail with static config"),
            active_sessions: Mutex::new(HashMap::new()),
            activity_callback: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_activity_callback(&self, callback: ActivityCallback) {
        *self.activity_callback.lock().unwrap() = Some(callback);
    }

    fn emit_activity(&self, agent: &str, action: &'static str, message: String, detail: Option<String>) {
        let callback = self.activity_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(ActivityEvent {
                agent: agent.to_string(),
                action,
                message,
                detail,
            });
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/agent", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn list_agents(&self) -> Vec<Value> {
        match self.client.get(format!("{}/agent", self.base_url)).send().await {
            Ok(response) => response.json().await.unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Create a fresh session on the server and return its id.
    pub async fn create_session(&self, title: &str) -> SubagentResult<String> {
        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?;
        let session: Value = response.json().await?;
        session
            .get("id")
            .or_else(|| session.get("session_id"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or(SubagentError::NoSessionId)
    }

    pub fn cached_session(&self, agent: &str) -> Option<String> {
        self.active_sessions.lock().unwrap().get(agent).cloned()
    }

    pub fn clear_session(&self, agent: &str) {
        self.active_sessions.lock().unwrap().remove(agent);
    }

    /// Create a session for `agent` (replacing any cached one) and send the
    /// message, polling for the reply.
    pub async fn engage(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
        if !self.health_check().await {
            return vec![SubagentEvent::Error {
                content: format!(
                    "Subagent server not available at {}. Make sure it is running with 'opencode serve'.",
                    self.base_url
                ),
            }];
        }

        let session_id = match self.create_session(&format!("Parley: {agent}")).await {
            Ok(id) => id,
            Err(e) => {
                return vec![SubagentEvent::Error {
                    content: format!("Failed to create subagent session: {e}"),
                }];
            }
        };
        self.active_sessions
            .lock()
            .unwrap()
            .insert(agent.to_string(), session_id.clone());

        self.emit_activity(agent, "started", format!("Engaging {agent}"), Some(truncate(message, 200)));
        self.send_and_poll(&session_id, agent, message).await
    }

    /// Continue the cached session for `agent`, or engage fresh if none.
    pub async fn continue_session(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
        let session_id = match self.cached_session(agent) {
            Some(id) => id,
            None => return Box::pin(self.engage(agent, message)).await,
        };

        self.emit_activity(agent, "started", format!("Continuing {agent}"), Some(truncate(message, 200)));
        self.send_and_poll(&session_id, agent, message).await
    }

    /// Send to an explicit session id (thread relay path).
    pub async fn send_to_session(&self, session_id: &str, agent: &str, message: &str) -> Vec<SubagentEvent> {
        self.send_and_poll(session_id, agent, message).await
    }

    async fn list_messages(&self, session_id: &str) -> SubagentResult<Vec<Value>> {
        let response = self
            .client
            .get(format!("{}/session/{}/message", self.base_url, session_id))
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn send_and_poll(&self, session_id: &str, agent: &str, message: &str) -> Vec<SubagentEvent> {
        // Baseline assistant ids so an older response is never mistaken for
        // the reply to this prompt.
        let baseline: Vec<String> = match self.list_messages(session_id).await {
            Ok(messages) => messages.iter().filter_map(assistant_message_id).collect(),
            Err(_) => Vec::new(),
        };

        let send_result = self
            .client
            .post(format!("{}/session/{}/prompt_async", self.base_url, session_id))
            .json(&serde_json::json!({
                "agent": agent,
                "parts": [{"type": "text", "text": message}],
            }))
            .send()
            .await;
        if let Err(e) = send_result {
            return vec![SubagentEvent::Error { content: format!("Failed to send prompt: {e}") }];
        }
        self.emit_activity(
            agent,
            "request_sent",
            format!("Request sent to {agent}"),
            Some(format!("Session: {}...", truncate(session_id, 8))),
        );

        let started = Instant::now();
        let mut interval = POLL_INITIAL_INTERVAL;
        let mut tracker = PollTracker::new(baseline);

        while started.elapsed() < POLL_TIMEOUT {
            let messages = match self.list_messages(session_id).await {
                Ok(messages) => messages,
                Err(e) => {
                    return vec![SubagentEvent::Error {
                        content: format!("Failed to poll subagent messages: {e}"),
                    }];
                }
            };

            match tracker.observe(&messages) {
                PollOutcome::RemoteError(error) => {
                    return vec![SubagentEvent::Error { content: format!("Subagent error: {error}") }];
                }
                PollOutcome::Complete(content) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    self.emit_activity(
                        agent,
                        "completed",
                        format!("{agent} finished ({:.1}s)", duration_ms as f64 / 1000.0),
                        Some(truncate(&content, 500)),
                    );
                    return vec![
                        SubagentEvent::Message { content: content.clone() },
                        SubagentEvent::Complete { content, duration_ms },
                    ];
                }
                PollOutcome::Pending => {}
            }

            tokio::time::sleep(interval).await;
            interval = Duration::from_secs_f64(
                (interval.as_secs_f64() * POLL_BACKOFF_FACTOR).min(POLL_MAX_INTERVAL.as_secs_f64()),
            );
        }

        self.emit_activity(agent, "error", format!("{agent} timed out"), None);
        vec![SubagentEvent::Error { content: format!("Timeout waiting for {agent} response") }]
    }
}

/// Collect the final text content from a stream of subagent events; errors
/// win over messages only when no message arrived.
pub fn final_response(events: &[SubagentEvent]) -> Result<String, String> {
    let mut last_message: Option<&str> = None;
    let mut last_error: Option<&str> = None;
    for event in events {
        match event {
            SubagentEvent::Message { content } | SubagentEvent::Complete { content, .. } => {
                last_message = Some(content);
            }
            SubagentEvent::Error { content } => last_error = Some(content),
        }
    }
    match (last_message, last_error) {
        (Some(message), _) => Ok(message.to_string()),
        (None, Some(error)) => Err(error.to_string()),
        (None, None) => Ok(String::new()),
    }
}

// ==================== Poll state ====================

enum PollOutcome {
    Pending,
    Complete(String),
    RemoteError(String),
}

/// Pure polling state: which assistant message we latched onto and how long
/// its content has been stable.
struct PollTracker {
    baseline: Vec<String>,
    active_message_id: Option<String>,
    last_content_len: usize,
    stable_polls: u32,
}

impl PollTracker {
    fn new(baseline: Vec<String>) -> Self {
        Self {
            baseline,
            active_message_id: None,
            last_content_len: 0,
            stable_polls: 0,
        }
    }

    fn observe(&mut self, messages: &[Value]) -> PollOutcome {
        // Fail fast on errors the server surfaced on any message.
        for msg in messages {
            let info = message_info(msg);
            if let Some(error) = info.get("error") {
                if !error.is_null() {
                    let text = error
                        .get("data")
                        .and_then(|d| d.get("message"))
                        .and_then(|m| m.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| error.to_string());
                    return PollOutcome::RemoteError(text);
                }
            }
        }

        // Candidate assistant messages not present before the prompt.
        let candidates: Vec<&Value> = messages
            .iter()
            .filter(|msg| {
                let info = message_info(msg);
                if info.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                    return false;
                }
                match assistant_message_id(msg) {
                    Some(id) => !self.baseline.contains(&id),
                    None => true,
                }
            })
            .collect();

        if candidates.is_empty() {
            return PollOutcome::Pending;
        }

        // Latch onto one message and stick with it for the whole poll.
        let latched = self.active_message_id.clone();
        let existing = latched.as_deref().and_then(|active| {
            candidates
                .iter()
                .find(|c| assistant_message_id(c).as_deref() == Some(active))
                .copied()
        });
        let chosen = match existing {
            Some(chosen) => chosen,
            None => {
                // Earliest new assistant message wins and stays latched.
                let chosen = *candidates.first().expect("candidates is non-empty");
                self.active_message_id = assistant_message_id(chosen);
                self.last_content_len = 0;
                self.stable_polls = 0;
                chosen
            }
        };

        let info = message_info(chosen);
        let content = aggregate_text(chosen);

        let status = info.get("status").and_then(|s| s.as_str()).unwrap_or("");
        let mut complete = matches!(status, "done" | "complete" | "finished" | "success")
            || info.get("complete").and_then(|v| v.as_bool()) == Some(true)
            || info.get("finished").and_then(|v| v.as_bool()) == Some(true)
            || info.get("finish").map(|v| !v.is_null()).unwrap_or(false);

        if !content.is_empty() {
            if content.len() > self.last_content_len {
                self.last_content_len = content.len();
                self.stable_polls = 0;
            } else if content.len() == self.last_content_len {
                self.stable_polls += 1;
            }
        }

        // Some server builds never expose message status. If the content has
        // stopped changing and there is no status signal at all, call it done.
        if !content.is_empty()
            && !complete
            && status.is_empty()
            && self.stable_polls >= STABLE_POLLS_FOR_COMPLETION
        {
            complete = true;
        }

        if complete {
            PollOutcome::Complete(content)
        } else {
            PollOutcome::Pending
        }
    }
}

/// Servers wrap message metadata in an `info` field, or don't.
fn message_info(msg: &Value) -> &Value {
    msg.get("info").unwrap_or(msg)
}

fn assistant_message_id(msg: &Value) -> Option<String> {
    let info = message_info(msg);
    if info.get("role").and_then(|r| r.as_str()) != Some("assistant") {
        return None;
    }
    info.get("id")
        .or_else(|| info.get("messageID"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Concatenated text parts of a message.
fn aggregate_text(msg: &Value) -> String {
    msg.get("parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let prefix: String = text.chars().take(max).collect();
        format!("{prefix}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(id: &str, text: &str, status: Option<&str>) -> Value {
        let mut info = json!({"id": id, "role": "assistant"});
        if let Some(status) = status {
            info["status"] = json!(status);
        }
        json!({"info": info, "parts": [{"type": "text", "text": text}]})
    }

    #[test]
    fn test_baseline_messages_are_ignored() {
        let mut tracker = PollTracker::new(vec!["old".to_string()]);
        let messages = vec![assistant("old", "stale reply", Some("done"))];
        assert!(matches!(tracker.observe(&messages), PollOutcome::Pending));
    }

    #[test]
    fn test_explicit_status_completes() {
        let mut tracker = PollTracker::new(Vec::new());
        let messages = vec![assistant("m1", "the answer", Some("done"))];
        match tracker.observe(&messages) {
            PollOutcome::Complete(content) => assert_eq!(content, "the answer"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn test_stable_content_fallback_after_twelve_polls() {
        let mut tracker = PollTracker::new(Vec::new());
        let messages = vec![assistant("m1", "partial", None)];

        // First observation latches the message; then the content must stay
        // stable for 12 further polls.
        assert!(matches!(tracker.observe(&messages), PollOutcome::Pending));
        for _ in 0..11 {
            assert!(matches!(tracker.observe(&messages), PollOutcome::Pending));
        }
        match tracker.observe(&messages) {
            PollOutcome::Complete(content) => assert_eq!(content, "partial"),
            _ => panic!("expected fallback completion"),
        }
    }

    #[test]
    fn test_growing_content_resets_stability() {
        let mut tracker = PollTracker::new(Vec::new());
        let short = vec![assistant("m1", "part", None)];
        let long = vec![assistant("m1", "part two", None)];

        for _ in 0..8 {
            assert!(matches!(tracker.observe(&short), PollOutcome::Pending));
        }
        assert!(matches!(tracker.observe(&long), PollOutcome::Pending));
        // Still pending: the stability counter restarted on growth.
        for _ in 0..11 {
            assert!(matches!(tracker.observe(&long), PollOutcome::Pending));
        }
        assert!(matches!(tracker.observe(&long), PollOutcome::Complete(_)));
    }

    #[test]
    fn test_stable_fallback_not_used_when_server_reports_status() {
        let mut tracker = PollTracker::new(Vec::new());
        let messages = vec![assistant("m1", "thinking", Some("working"))];
        for _ in 0..20 {
            assert!(matches!(tracker.observe(&messages), PollOutcome::Pending));
        }
    }

    #[test]
    fn test_remote_error_fails_fast() {
        let mut tracker = PollTracker::new(Vec::new());
        let messages = vec![json!({
            "info": {"id": "m1", "role": "assistant", "error": {"data": {"message": "model overloaded"}}},
            "parts": []
        })];
        match tracker.observe(&messages) {
            PollOutcome::RemoteError(text) => assert!(text.contains("model overloaded")),
            _ => panic!("expected remote error"),
        }
    }

    #[test]
    fn test_sticks_to_first_new_message() {
        let mut tracker = PollTracker::new(Vec::new());
        let first = vec![assistant("m1", "first reply", None)];
        assert!(matches!(tracker.observe(&first), PollOutcome::Pending));

        // A newer assistant message appears; the tracker stays latched to m1.
        let both = vec![
            assistant("m1", "first reply", Some("done")),
            assistant("m2", "other reply", None),
        ];
        match tracker.observe(&both) {
            PollOutcome::Complete(content) => assert_eq!(content, "first reply"),
            _ => panic!("expected completion of the latched message"),
        }
    }

    #[test]
    fn test_final_response_prefers_messages() {
        let events = vec![
            SubagentEvent::Message { content: "hello".to_string() },
            SubagentEvent::Complete { content: "hello world".to_string(), duration_ms: 10 },
        ];
        assert_eq!(final_response(&events).unwrap(), "hello world");

        let errors = vec![SubagentEvent::Error { content: "boom".to_string() }];
        assert_eq!(final_response(&errors).unwrap_err(), "boom");
    }
}
