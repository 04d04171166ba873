//! HTTP client for builder servers.
//!
//! Builders expose the same session API as the subagent server plus
//! `POST /session/{id}/abort`. A task is dispatched either in plan mode
//! (the builder proposes, the user approves) or straight into build mode.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Builds and plans can run long.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to create session: status {0}")]
    SessionCreate(u16),
    #[error("Failed to send prompt: status {0}")]
    PromptSend(u16),
    #[error("Session creation returned no id")]
    NoSessionId,
    #[error("No plan session for task {0}")]
    NoPlanSession(String),
    #[error("No active session for task {0}")]
    NoActiveSession(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BuilderResult<T> = Result<T, BuilderError>;

/// Outcome of a dispatch call.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub session_id: String,
    pub awaiting_review: bool,
}

pub struct BuilderClient {
    pub name: String,
    base_url: Mutex<String>,
    model: String,
    client: reqwest::Client,
    /// task_id → session_id for build-mode sessions.
    active_sessions: Mutex<HashMap<String, String>>,
    /// task_id → session_id for plan-mode sessions awaiting approval.
    plan_sessions: Mutex<HashMap<String, String>>,
    /// task_id → project root used when the session was created.
    task_directories: Mutex<HashMap<String, String>>,
}

impl BuilderClient {
    pub fn new(name: &str, base_url: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: Mutex::new(base_url.trim_end_matches('/').to_string()),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("HTTP client construction cannot fail with static config"),
            active_sessions: Mutex::new(HashMap::new()),
            plan_sessions: Mutex::new(HashMap::new()),
            task_directories: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> String {
        self.base_url.lock().unwrap().clone()
    }

    pub fn set_base_url(&self, url: &str) {
        *self.base_url.lock().unwrap() = url.trim_end_matches('/').to_string();
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.plan_sessions.lock().unwrap().contains_key(task_id)
            || self.active_sessions.lock().unwrap().contains_key(task_id)
    }

    pub fn has_plan(&self, task_id: &str) -> bool {
        self.plan_sessions.lock().unwrap().contains_key(task_id)
    }

    /// Re-attach a session recovered from the store (after restart).
    pub fn adopt_session(&self, task_id: &str, session_id: &str, project_root: Option<&str>) {
        self.plan_sessions
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_insert_with(|| session_id.to_string());
        if let Some(root) = project_root {
            self.task_directories
                .lock()
                .unwrap()
                .entry(task_id.to_string())
                .or_insert_with(|| root.to_string());
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/agent", self.base_url())).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn create_session(&self, title: &str) -> BuilderResult<String> {
        let response = self
            .client
            .post(format!("{}/session", self.base_url()))
            .json(&json!({ "title": title }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BuilderError::SessionCreate(response.status().as_u16()));
        }
        let session: Value = response.json().await?;
        session
            .get("id")
            .or_else(|| session.get("session_id"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or(BuilderError::NoSessionId)
    }

    async fn send_prompt(&self, session_id: &str, text: &str) -> BuilderResult<()> {
        let response = self
            .client
            .post(format!("{}/session/{}/prompt_async", self.base_url(), session_id))
            .json(&json!({ "parts": [{"type": "text", "text": text}] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BuilderError::PromptSend(response.status().as_u16()));
        }
        Ok(())
    }

    async fn read_prompt(&self, prompt_path: &str, project_root: Option<&str>) -> BuilderResult<String> {
        let mut content = tokio::fs::read_to_string(Path::new(prompt_path)).await?;
        if let Some(root) = project_root {
            content = format!(
                "## Project Context\nWorking directory: {root}\nAll file operations should be relative to this directory.\n\n---\n\n{content}"
            );
        }
        Ok(content)
    }

    /// Dispatch straight into build mode.
    pub async fn dispatch_task(
        &self,
        task_id: &str,
        prompt_path: &str,
        project_root: Option<&str>,
    ) -> BuilderResult<Dispatch> {
        let prompt = self.read_prompt(prompt_path, project_root).await?;
        let session_id = self.create_session(&format!("Task: {}", short(task_id))).await?;

        self.active_sessions
            .lock()
            .unwrap()
            .insert(task_id.to_string(), session_id.clone());
        if let Some(root) = project_root {
            self.task_directories
                .lock()
                .unwrap()
                .insert(task_id.to_string(), root.to_string());
        }

        self.send_prompt(&session_id, &prompt).await?;
        Ok(Dispatch { session_id, awaiting_review: false })
    }

    /// Dispatch in plan mode: the builder proposes a plan for review before
    /// any code is written.
    pub async fn dispatch_task_plan_mode(
        &self,
        task_id: &str,
        prompt_path: &str,
        project_root: Option<&str>,
    ) -> BuilderResult<Dispatch> {
        let prompt = self.read_prompt(prompt_path, project_root).await?;
        let plan_prompt = format!("/plan {prompt}");

        let session_id = self.create_session(&format!("Plan: {}", short(task_id))).await?;
        self.plan_sessions
            .lock()
            .unwrap()
            .insert(task_id.to_string(), session_id.clone());
        if let Some(root) = project_root {
            self.task_directories
                .lock()
                .unwrap()
                .insert(task_id.to_string(), root.to_string());
        }

        self.send_prompt(&session_id, &plan_prompt).await?;
        Ok(Dispatch { session_id, awaiting_review: true })
    }

    /// Concatenated text of the last assistant message in the plan session.
    pub async fn get_plan_response(&self, task_id: &str) -> BuilderResult<String> {
        let session_id = self
            .plan_sessions
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| BuilderError::NoPlanSession(task_id.to_string()))?;

        let response = self
            .client
            .get(format!("{}/session/{}/message", self.base_url(), session_id))
            .send()
            .await?;
        let messages: Vec<Value> = response.json().await?;

        let mut plan = String::new();
        for msg in &messages {
            let info = msg.get("info").unwrap_or(msg);
            if info.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                continue;
            }
            let content: String = msg
                .get("parts")
                .and_then(|p| p.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect()
                })
                .unwrap_or_default();
            if !content.is_empty() {
                plan = content;
            }
        }

        if plan.is_empty() {
            return Err(BuilderError::NoPlanSession(task_id.to_string()));
        }
        Ok(plan)
    }

    /// Approve the plan (optionally with modifications) and migrate the
    /// session from plan to active.
    pub async fn approve_and_build(&self, task_id: &str, modifications: &str) -> BuilderResult<String> {
        let session_id = self
            .plan_sessions
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| BuilderError::NoPlanSession(task_id.to_string()))?;

        let approval = if modifications.is_empty() {
            "Looks good, proceed with the implementation.".to_string()
        } else {
            format!("Proceed with these modifications: {modifications}")
        };
        self.send_prompt(&session_id, &approval).await?;

        self.plan_sessions.lock().unwrap().remove(task_id);
        self.active_sessions
            .lock()
            .unwrap()
            .insert(task_id.to_string(), session_id.clone());
        Ok(session_id)
    }

    /// Reply into whichever session (plan or active) a task currently has.
    pub async fn send_to_task(&self, task_id: &str, message: &str) -> BuilderResult<(String, String)> {
        let session_id = {
            let active = self.active_sessions.lock().unwrap().get(task_id).cloned();
            active.or_else(|| self.plan_sessions.lock().unwrap().get(task_id).cloned())
        }
        .ok_or_else(|| BuilderError::NoActiveSession(task_id.to_string()))?;

        self.send_prompt(&session_id, message).await?;

        // The reply lands in the session's message list; reuse the plan
        // retrieval path (it reads the last assistant message).
        let response = self
            .client
            .get(format!("{}/session/{}/message", self.base_url(), session_id))
            .send()
            .await?;
        let messages: Vec<Value> = response.json().await?;
        let mut last_text = String::new();
        for msg in &messages {
            let info = msg.get("info").unwrap_or(msg);
            if info.get("role").and_then(|r| r.as_str()) != Some("assistant") {
                continue;
            }
            if let Some(parts) = msg.get("parts").and_then(|p| p.as_array()) {
                let text: String = parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect();
                if !text.is_empty() {
                    last_text = text;
                }
            }
        }
        Ok((session_id, last_text))
    }

    /// Builder session status for the monitor.
    pub async fn get_session_status(&self, task_id: &str) -> Option<String> {
        let session_id = self.active_sessions.lock().unwrap().get(task_id).cloned()?;
        let response = self
            .client
            .get(format!("{}/session/{}", self.base_url(), session_id))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: Value = response.json().await.ok()?;
        data.get("status").and_then(|s| s.as_str()).map(String::from)
    }

    /// Abort a running session.
    pub async fn cancel_session(&self, task_id: &str) -> bool {
        let Some(session_id) = self.active_sessions.lock().unwrap().get(task_id).cloned() else {
            return false;
        };
        match self
            .client
            .post(format!("{}/session/{}/abort", self.base_url(), session_id))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                self.active_sessions.lock().unwrap().remove(task_id);
                true
            }
            _ => false,
        }
    }
}

fn short(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Named builder clients, shared across the dispatcher, monitor, and
/// dashboard.
#[derive(Default)]
pub struct BuilderRegistry {
    builders: Mutex<HashMap<String, Arc<BuilderClient>>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, builder: Arc<BuilderClient>) {
        self.builders.lock().unwrap().insert(name.to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<BuilderClient>> {
        self.builders.lock().unwrap().get(name).cloned()
    }

    /// Deterministic fallback when a routed name is not registered: the
    /// first builder by name.
    pub fn default_builder(&self) -> Option<Arc<BuilderClient>> {
        let guard = self.builders.lock().unwrap();
        guard.iter().min_by(|a, b| a.0.cmp(b.0)).map(|(_, b)| b.clone())
    }

    pub fn all(&self) -> Vec<Arc<BuilderClient>> {
        self.builders.lock().unwrap().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.builders.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.builders.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.lock().unwrap().is_empty()
    }

    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let builders: Vec<_> = {
            let guard = self.builders.lock().unwrap();
            guard.iter().map(|(n, b)| (n.clone(), b.clone())).collect()
        };
        let mut results = HashMap::new();
        for (name, builder) in builders {
            results.insert(name, builder.health_check().await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_get() {
        let registry = BuilderRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            "opencode-fast",
            Arc::new(BuilderClient::new("opencode-fast", "http://localhost:8002", "m")),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("opencode-fast").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_adopt_session_is_idempotent() {
        let builder = BuilderClient::new("b", "http://localhost:8002", "m");
        builder.adopt_session("task-1", "ses_a", Some("/proj"));
        builder.adopt_session("task-1", "ses_b", Some("/other"));

        // First adoption wins.
        assert!(builder.has_plan("task-1"));
        assert_eq!(
            builder.plan_sessions.lock().unwrap().get("task-1").unwrap(),
            "ses_a"
        );
        assert_eq!(
            builder.task_directories.lock().unwrap().get("task-1").unwrap(),
            "/proj"
        );
    }

    #[test]
    fn test_has_task_checks_both_maps() {
        let builder = BuilderClient::new("b", "http://localhost:8002", "m");
        assert!(!builder.has_task("t"));
        builder.active_sessions.lock().unwrap().insert("t".to_string(), "s".to_string());
        assert!(builder.has_task("t"));
        assert!(!builder.has_plan("t"));
    }
}
