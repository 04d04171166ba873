//! Background polling for builder task completion.

use crate::builder::BuilderRegistry;
use crate::dashboard::ConnectionManager;
use crate::store::{
    build_completed_payload, build_failed_payload, EventStore, EventType, InboxItem, InboxSeverity,
    TaskStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Called with `(task_id, status, title)` when a task finishes. Callback
/// errors are the callback's problem; the loop keeps polling.
pub type CompletionCallback = Box<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Watches running tasks and emits completion events + inbox items when a
/// builder reports done or failed.
pub struct BuildMonitor {
    store: EventStore,
    builders: Arc<BuilderRegistry>,
    interval: Duration,
    on_completion: Option<CompletionCallback>,
    ws: Option<Arc<ConnectionManager>>,
}

impl BuildMonitor {
    pub fn new(store: EventStore, builders: Arc<BuilderRegistry>, interval: Duration) -> Self {
        Self {
            store,
            builders,
            interval,
            on_completion: None,
            ws: None,
        }
    }

    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_completion = Some(callback);
        self
    }

    pub fn with_ws(mut self, ws: Arc<ConnectionManager>) -> Self {
        self.ws = Some(ws);
        self
    }

    /// Run the polling loop forever. One bad tick never kills the loop.
    pub async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Build monitor started");
        loop {
            if let Err(e) = self.check_running_tasks().await {
                tracing::warn!(error = %e, "Monitor tick failed");
            }

            if let Some(ws) = &self.ws {
                let active = self.store.get_active_tasks().map(|t| t.len()).unwrap_or(0);
                let unread = self.store.get_inbox(true, None, 1000).map(|i| i.len()).unwrap_or(0);
                ws.broadcast(
                    "system_health",
                    json!({ "active_tasks": active, "unread_inbox": unread }),
                );
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    async fn check_running_tasks(&self) -> Result<(), crate::store::StoreError> {
        let running: Vec<_> = self
            .store
            .get_active_tasks()?
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Running | TaskStatus::HandedOff))
            .collect();

        for task in running {
            let Some(status) = self.check_task_status(&task.task_id).await else {
                continue;
            };
            match status.as_str() {
                "completed" => self.handle_completion(&task.task_id, &task.title, true),
                "failed" => self.handle_completion(&task.task_id, &task.title, false),
                _ => {}
            }
        }
        Ok(())
    }

    /// First builder with a definite status wins.
    async fn check_task_status(&self, task_id: &str) -> Option<String> {
        for builder in self.builders.all() {
            match builder.get_session_status(task_id).await.as_deref() {
                Some("completed") => {
                    self.broadcast_builder_status(&builder.name, "completed");
                    return Some("completed".to_string());
                }
                Some("failed") | Some("error") => {
                    self.broadcast_builder_status(&builder.name, "failed");
                    return Some("failed".to_string());
                }
                _ => {}
            }
        }
        None
    }

    fn broadcast_builder_status(&self, name: &str, status: &str) {
        if let Some(ws) = &self.ws {
            ws.broadcast("builder_status", json!({ "name": name, "status": status }));
        }
    }

    fn handle_completion(&self, task_id: &str, title: &str, completed: bool) {
        let (event_type, payload, severity, status) = if completed {
            (
                EventType::BuildCompleted,
                build_completed_payload(task_id, json!({})),
                InboxSeverity::Success,
                "completed",
            )
        } else {
            (
                EventType::BuildFailed,
                build_failed_payload(task_id, "Build failed"),
                InboxSeverity::Error,
                "failed",
            )
        };

        if let Err(e) = self.store.update_task_status(task_id, event_type, payload) {
            tracing::warn!(error = %e, task_id, "Failed to record completion event");
            return;
        }

        let item = InboxItem::new(
            severity,
            format!("Task '{title}' {status}"),
            json!({ "task_id": task_id }),
        );
        if let Err(e) = self.store.add_inbox_item(&item) {
            tracing::warn!(error = %e, "Failed to add completion inbox item");
        } else if let Some(ws) = &self.ws {
            ws.broadcast(
                "inbox_item",
                json!({
                    "inbox_id": item.inbox_id,
                    "severity": item.severity.as_str(),
                    "summary": item.summary,
                }),
            );
        }

        tracing::info!(task_id = %task_id.chars().take(8).collect::<String>(), title, status, "Task finished");

        if let Some(callback) = &self.on_completion {
            callback(task_id, status, title);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::builder_dispatched_payload;
    use std::sync::Mutex;

    #[test]
    fn test_handle_completion_emits_event_and_inbox() {
        let store = EventStore::open_in_memory().unwrap();
        let task = store.create_task("Monitored", None, None).unwrap();
        store
            .update_task_status(
                &task.task_id,
                EventType::BuilderDispatched,
                builder_dispatched_payload("ses_1", "opencode"),
            )
            .unwrap();

        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let monitor = BuildMonitor::new(
            store.clone(),
            Arc::new(BuilderRegistry::new()),
            DEFAULT_INTERVAL,
        )
        .with_completion_callback(Box::new(move |task_id, status, _title| {
            seen_clone.lock().unwrap().push((task_id.to_string(), status.to_string()));
        }));

        monitor.handle_completion(&task.task_id, "Monitored", true);

        let updated = store.get_task(&task.task_id).unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Done);

        let inbox = store.get_inbox(true, None, 10).unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].summary.contains("completed"));
        assert_eq!(inbox[0].severity, InboxSeverity::Success);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(task.task_id.clone(), "completed".to_string())]
        );
    }

    #[test]
    fn test_failed_completion() {
        let store = EventStore::open_in_memory().unwrap();
        let task = store.create_task("Doomed", None, None).unwrap();

        let monitor =
            BuildMonitor::new(store.clone(), Arc::new(BuilderRegistry::new()), DEFAULT_INTERVAL);
        monitor.handle_completion(&task.task_id, "Doomed", false);

        let updated = store.get_task(&task.task_id).unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::Failed);

        let inbox = store.get_inbox(true, None, 10).unwrap();
        assert_eq!(inbox[0].severity, InboxSeverity::Error);
    }
}
