//! Event store schema and record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization.
///
/// `events` is the append-only log; `tasks`, `inbox`, and `mappings` are
/// derived state that can be rebuilt by replaying events.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    time TEXT NOT NULL,
    type TEXT NOT NULL,
    task_id TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    external_id TEXT,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    project_root TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    working_prompt_path TEXT,
    handoff_prompt_path TEXT,
    builder_session_id TEXT,
    last_event_id INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS inbox (
    inbox_id TEXT PRIMARY KEY,
    severity TEXT NOT NULL,
    summary TEXT NOT NULL,
    refs TEXT NOT NULL,
    created_at TEXT NOT NULL,
    acknowledged_at TEXT
);

CREATE TABLE IF NOT EXISTS mappings (
    task_id TEXT PRIMARY KEY,
    external_id TEXT,
    session_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_inbox_ack ON inbox(acknowledged_at);
CREATE INDEX IF NOT EXISTS idx_inbox_severity ON inbox(severity);
"#;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Refining,
    ReadyToHandoff,
    HandedOff,
    Running,
    AwaitingGate,
    AwaitingUser,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Refining => "refining",
            TaskStatus::ReadyToHandoff => "ready_to_handoff",
            TaskStatus::HandedOff => "handed_off",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingGate => "awaiting_gate",
            TaskStatus::AwaitingUser => "awaiting_user",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "refining" => TaskStatus::Refining,
            "ready_to_handoff" => TaskStatus::ReadyToHandoff,
            "handed_off" => TaskStatus::HandedOff,
            "running" => TaskStatus::Running,
            "awaiting_gate" => TaskStatus::AwaitingGate,
            "awaiting_user" => TaskStatus::AwaitingUser,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "canceled" => TaskStatus::Canceled,
            _ => TaskStatus::Draft,
        }
    }

    /// Terminal tasks never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event types in the task lifecycle log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    TaskCreated,
    WorkingPromptUpdated,
    QuestionsRaised,
    UserAnswered,
    HandoffFrozen,
    BuilderDispatched,
    BuilderStatusChanged,
    GateRequested,
    GateApproved,
    GateDenied,
    BuildCompleted,
    BuildFailed,
    TaskCanceled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskCreated => "TaskCreated",
            EventType::WorkingPromptUpdated => "WorkingPromptUpdated",
            EventType::QuestionsRaised => "QuestionsRaised",
            EventType::UserAnswered => "UserAnswered",
            EventType::HandoffFrozen => "HandoffFrozen",
            EventType::BuilderDispatched => "BuilderDispatched",
            EventType::BuilderStatusChanged => "BuilderStatusChanged",
            EventType::GateRequested => "GateRequested",
            EventType::GateApproved => "GateApproved",
            EventType::GateDenied => "GateDenied",
            EventType::BuildCompleted => "BuildCompleted",
            EventType::BuildFailed => "BuildFailed",
            EventType::TaskCanceled => "TaskCanceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "TaskCreated" => EventType::TaskCreated,
            "WorkingPromptUpdated" => EventType::WorkingPromptUpdated,
            "QuestionsRaised" => EventType::QuestionsRaised,
            "UserAnswered" => EventType::UserAnswered,
            "HandoffFrozen" => EventType::HandoffFrozen,
            "BuilderDispatched" => EventType::BuilderDispatched,
            "BuilderStatusChanged" => EventType::BuilderStatusChanged,
            "GateRequested" => EventType::GateRequested,
            "GateApproved" => EventType::GateApproved,
            "GateDenied" => EventType::GateDenied,
            "BuildCompleted" => EventType::BuildCompleted,
            "BuildFailed" => EventType::BuildFailed,
            "TaskCanceled" => EventType::TaskCanceled,
            _ => return None,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbox notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSeverity {
    Info,
    Success,
    Warning,
    Error,
    Blocking,
}

impl InboxSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxSeverity::Info => "info",
            InboxSeverity::Success => "success",
            InboxSeverity::Warning => "warning",
            InboxSeverity::Error => "error",
            InboxSeverity::Blocking => "blocking",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => InboxSeverity::Success,
            "warning" => InboxSeverity::Warning,
            "error" => InboxSeverity::Error,
            "blocking" => InboxSeverity::Blocking,
            _ => InboxSeverity::Info,
        }
    }
}

impl fmt::Display for InboxSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only event in the task lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Assigned by the database on insert; 0 before that.
    pub event_id: i64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub task_id: String,
    pub payload: serde_json::Value,
}

impl TaskEvent {
    pub fn new(event_type: EventType, task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: 0,
            time: Utc::now(),
            event_type,
            task_id: task_id.into(),
            payload,
        }
    }
}

/// A unit of work derived from the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub project_root: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_prompt_path: Option<String>,
    pub handoff_prompt_path: Option<String>,
    pub builder_session_id: Option<String>,
    pub last_event_id: i64,
}

/// A user-facing notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub inbox_id: String,
    pub severity: InboxSeverity,
    pub summary: String,
    /// Freeform references: conventionally `task_id`, `thread_id`, `session_id`.
    pub refs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl InboxItem {
    pub fn new(severity: InboxSeverity, summary: impl Into<String>, refs: serde_json::Value) -> Self {
        Self {
            inbox_id: uuid::Uuid::new_v4().to_string(),
            severity,
            summary: summary.into(),
            refs,
            created_at: Utc::now(),
            acknowledged_at: None,
        }
    }

    pub fn is_unread(&self) -> bool {
        self.acknowledged_at.is_none()
    }
}

/// Maps a task to its external tracker id and builder session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMapping {
    pub task_id: String,
    pub external_id: Option<String>,
    pub session_id: Option<String>,
}

// Event payload helpers. Payloads stay loose JSON on the wire; these keep
// the field names in one place.

pub fn task_created_payload(
    title: &str,
    working_prompt_path: Option<&str>,
    project_root: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "title": title,
        "working_prompt_path": working_prompt_path,
        "project_root": project_root,
    })
}

pub fn working_prompt_updated_payload(path: &str, summary: Option<&str>) -> serde_json::Value {
    serde_json::json!({ "path": path, "summary": summary })
}

pub fn handoff_frozen_payload(handoff_md_path: &str, handoff_json_path: &str) -> serde_json::Value {
    serde_json::json!({
        "handoff_md_path": handoff_md_path,
        "handoff_json_path": handoff_json_path,
    })
}

pub fn builder_dispatched_payload(session_id: &str, provider: &str) -> serde_json::Value {
    serde_json::json!({ "session_id": session_id, "provider": provider })
}

pub fn builder_status_changed_payload(
    session_id: &str,
    old_status: &str,
    new_status: &str,
) -> serde_json::Value {
    serde_json::json!({
        "session_id": session_id,
        "old_status": old_status,
        "new_status": new_status,
    })
}

pub fn build_completed_payload(session_id: &str, artifacts: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "session_id": session_id, "artifacts": artifacts })
}

pub fn build_failed_payload(session_id: &str, error: &str) -> serde_json::Value {
    serde_json::json!({ "session_id": session_id, "error": error })
}

pub fn task_canceled_payload(reason: &str) -> serde_json::Value {
    serde_json::json!({ "reason": reason })
}
