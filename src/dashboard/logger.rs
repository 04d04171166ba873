//! In-memory conversation transcript for the dashboard.

use crate::dashboard::ConnectionManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

const MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    System,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    pub entry_id: u64,
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

struct LoggerInner {
    entries: VecDeque<ConversationEntry>,
    pending_tool_calls: Vec<(String, u64, Instant)>,
    next_id: u64,
}

/// Ring buffer of conversation entries, broadcast to the dashboard as they
/// arrive.
pub struct ConversationLogger {
    inner: Mutex<LoggerInner>,
    ws: Mutex<Option<Arc<ConnectionManager>>>,
}

impl Default for ConversationLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLogger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LoggerInner {
                entries: VecDeque::with_capacity(MAX_ENTRIES),
                pending_tool_calls: Vec::new(),
                next_id: 1,
            }),
            ws: Mutex::new(None),
        }
    }

    /// Attach the WebSocket manager once the dashboard exists.
    pub fn attach_ws(&self, ws: Arc<ConnectionManager>) {
        *self.ws.lock().unwrap() = Some(ws);
    }

    /// The attached WebSocket manager, if the dashboard is up.
    pub fn ws_handle(&self) -> Option<Arc<ConnectionManager>> {
        self.ws.lock().unwrap().clone()
    }

    fn push(&self, entry: ConversationEntry) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.len() >= MAX_ENTRIES {
                inner.entries.pop_front();
            }
            inner.entries.push_back(entry.clone());
        }
        if let Some(ws) = self.ws.lock().unwrap().clone() {
            ws.broadcast("conversation_entry", serde_json::to_value(&entry).unwrap_or(Value::Null));
        }
    }

    fn next_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    pub fn log_user_speech(&self, transcript: &str) {
        self.push(ConversationEntry {
            entry_id: self.next_id(),
            role: ConversationRole::User,
            content: transcript.to_string(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_args: None,
            tool_result: None,
            duration_ms: None,
        });
    }

    pub fn log_assistant_response(&self, text: &str) {
        self.push(ConversationEntry {
            entry_id: self.next_id(),
            role: ConversationRole::Assistant,
            content: text.to_string(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_args: None,
            tool_result: None,
            duration_ms: None,
        });
    }

    pub fn log_tool_call_start(&self, tool_name: &str, tool_args: &Value) {
        let entry_id = self.next_id();
        self.inner
            .lock()
            .unwrap()
            .pending_tool_calls
            .push((tool_name.to_string(), entry_id, Instant::now()));
        self.push(ConversationEntry {
            entry_id,
            role: ConversationRole::ToolCall,
            content: format!("Calling {tool_name}..."),
            timestamp: Utc::now(),
            tool_name: Some(tool_name.to_string()),
            tool_args: Some(tool_args.clone()),
            tool_result: None,
            duration_ms: None,
        });
    }

    pub fn log_tool_call_complete(&self, tool_name: &str, result: &Value) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner.pending_tool_calls.iter().position(|(name, _, _)| name == tool_name);
            idx.map(|i| inner.pending_tool_calls.remove(i))
        };

        let failed = result.get("error").is_some();
        let status = if failed { "failed" } else { "completed" };

        match pending {
            Some((_, entry_id, started)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                // Update the original entry in place and rebroadcast it.
                let updated = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.entries.iter_mut().find(|e| e.entry_id == entry_id).map(|entry| {
                        entry.content = format!("{tool_name} {status}");
                        entry.tool_result = Some(result.clone());
                        entry.duration_ms = Some(duration_ms);
                        entry.clone()
                    })
                };
                if let (Some(entry), Some(ws)) = (updated, self.ws.lock().unwrap().clone()) {
                    ws.broadcast(
                        "conversation_entry",
                        serde_json::to_value(&entry).unwrap_or(Value::Null),
                    );
                }
            }
            None => {
                self.push(ConversationEntry {
                    entry_id: self.next_id(),
                    role: ConversationRole::ToolResult,
                    content: format!("{tool_name} result"),
                    timestamp: Utc::now(),
                    tool_name: Some(tool_name.to_string()),
                    tool_args: None,
                    tool_result: Some(result.clone()),
                    duration_ms: None,
                });
            }
        }
    }

    pub fn log_system_event(&self, message: &str) {
        self.push(ConversationEntry {
            entry_id: self.next_id(),
            role: ConversationRole::System,
            content: message.to_string(),
            timestamp: Utc::now(),
            tool_name: None,
            tool_args: None,
            tool_result: None,
            duration_ms: None,
        });
    }

    /// Entries newest first.
    pub fn get_entries(&self, limit: usize, offset: usize) -> Vec<ConversationEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_newest_first() {
        let logger = ConversationLogger::new();
        logger.log_user_speech("hello");
        logger.log_assistant_response("hi there");

        let entries = logger.get_entries(10, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, ConversationRole::Assistant);
        assert_eq!(entries[1].role, ConversationRole::User);
    }

    #[test]
    fn test_tool_call_pairing_sets_duration() {
        let logger = ConversationLogger::new();
        logger.log_tool_call_start("check_status", &json!({"verbose": false}));
        logger.log_tool_call_complete("check_status", &json!({"summary": "ok"}));

        let entries = logger.get_entries(10, 0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "check_status completed");
        assert!(entries[0].duration_ms.is_some());
        assert_eq!(entries[0].tool_result.as_ref().unwrap()["summary"], "ok");
    }

    #[test]
    fn test_orphan_tool_result() {
        let logger = ConversationLogger::new();
        logger.log_tool_call_complete("mystery", &json!({"error": "boom"}));

        let entries = logger.get_entries(10, 0);
        assert_eq!(entries[0].role, ConversationRole::ToolResult);
        assert_eq!(entries[0].content, "mystery result");
    }

    #[test]
    fn test_ring_buffer_caps_entries() {
        let logger = ConversationLogger::new();
        for i in 0..(MAX_ENTRIES + 10) {
            logger.log_user_speech(&format!("utterance {i}"));
        }
        assert_eq!(logger.get_entries(usize::MAX, 0).len(), MAX_ENTRIES);
    }
}
