//! Working-document and handoff management.
//!
//! Each task owns an on-disk pair: a human-readable `working.md` that grows
//! during conversation, and after freezing a `handoff.md` plus a structured
//! `handoff.json` handed to builders.

use crate::store::{
    handoff_frozen_payload, working_prompt_updated_payload, EventStore, EventType,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("No working document for task {0}")]
    PreconditionNotMet(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type PromptResult<T> = Result<T, PromptError>;

/// Constraints injected into every handoff, exactly once.
const STANDARD_CONSTRAINTS: [&str; 3] = [
    "Respect existing style and architecture.",
    "Do not modify secrets (.env, tokens). Redact if encountered.",
    "Ask before running commands or making destructive changes.",
];

/// Structured execution spec serialized to `handoff.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub goal: String,
    pub definition_of_done: Vec<String>,
    pub constraints: Vec<String>,
    pub repo_targets: Vec<String>,
    pub required_artifacts: Vec<String>,
    pub gates_required: Vec<String>,
    pub budgets: serde_json::Value,
}

impl ExecutionSpec {
    fn from_working(data: &WorkingPrompt) -> Self {
        let mut constraints: Vec<String> =
            STANDARD_CONSTRAINTS.iter().map(|s| s.to_string()).collect();
        constraints.extend(data.constraints.iter().cloned());

        Self {
            goal: data.intent.clone(),
            definition_of_done: data.requirements.clone(),
            constraints,
            repo_targets: Vec::new(),
            required_artifacts: vec!["diff summary".to_string(), "test output".to_string()],
            gates_required: vec!["write_gate".to_string(), "run_gate".to_string()],
            budgets: serde_json::json!({}),
        }
    }
}

/// In-memory representation of a working document.
#[derive(Debug, Clone)]
pub struct WorkingPrompt {
    pub title: String,
    pub intent: String,
    pub requirements: Vec<String>,
    pub constraints: Vec<String>,
    pub context: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkingPrompt {
    fn default() -> Self {
        Self {
            title: "Untitled Task".to_string(),
            intent: String::new(),
            requirements: Vec::new(),
            constraints: Vec::new(),
            context: String::new(),
            updated_at: Utc::now(),
        }
    }
}

impl WorkingPrompt {
    pub fn to_markdown(&self) -> String {
        let mut lines = vec![format!("# {}", self.title), String::new()];

        lines.push("## Intent".to_string());
        lines.push(if self.intent.is_empty() {
            "_Not yet defined_".to_string()
        } else {
            self.intent.clone()
        });
        lines.push(String::new());

        lines.push("## Requirements".to_string());
        if self.requirements.is_empty() {
            lines.push("_None specified yet_".to_string());
        } else {
            for req in &self.requirements {
                lines.push(format!("- {req}"));
            }
        }
        lines.push(String::new());

        lines.push("## Constraints".to_string());
        if self.constraints.is_empty() {
            lines.push("_None specified yet_".to_string());
        } else {
            for con in &self.constraints {
                lines.push(format!("- {con}"));
            }
        }
        lines.push(String::new());

        if !self.context.is_empty() {
            lines.push("## Context".to_string());
            lines.push(self.context.clone());
            lines.push(String::new());
        }

        lines.push(format!("_Last updated: {}_", self.updated_at.to_rfc3339()));
        lines.join("\n")
    }

    pub fn from_markdown(content: &str) -> Self {
        let mut data = Self::default();

        let title_re = Regex::new(r"(?m)^#\s+(.+)$").unwrap();
        if let Some(caps) = title_re.captures(content) {
            data.title = caps[1].trim().to_string();
        }

        let section_re = Regex::new(r"(?m)^##\s+").unwrap();
        let sections: Vec<&str> = section_re.split(content).collect();
        for section in sections.iter().skip(1) {
            let mut lines = section.lines();
            let header = lines.next().unwrap_or("").trim().to_lowercase();
            let body = lines.collect::<Vec<_>>().join("\n");
            let body = body.trim();

            match header.as_str() {
                "intent" => {
                    if !body.is_empty() && !body.starts_with('_') {
                        data.intent = body.to_string();
                    }
                }
                "requirements" => data.requirements = extract_list_items(body),
                "constraints" => data.constraints = extract_list_items(body),
                "context" => {
                    if !body.is_empty() && !body.starts_with('_') {
                        // Drop the trailing "_Last updated:_" footer if it
                        // landed inside the final section.
                        data.context = body
                            .lines()
                            .filter(|l| !l.trim_start().starts_with("_Last updated:"))
                            .collect::<Vec<_>>()
                            .join("\n")
                            .trim()
                            .to_string();
                    }
                }
                _ => {}
            }
        }

        data
    }
}

fn extract_list_items(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- ").map(|item| item.trim().to_string())
        })
        .collect()
}

/// Manages working/handoff files for tasks. Directories are keyed by the
/// first 8 characters of the task id.
pub struct PromptManager {
    workspace: PathBuf,
    store: Option<EventStore>,
    cached: Mutex<Option<(String, WorkingPrompt)>>,
}

impl PromptManager {
    pub fn new(workspace: impl Into<PathBuf>, store: Option<EventStore>) -> Self {
        Self {
            workspace: workspace.into(),
            store,
            cached: Mutex::new(None),
        }
    }

    pub fn prompt_dir(&self, task_id: &str) -> PathBuf {
        let key: String = task_id.chars().take(8).collect();
        self.workspace.join("prompts").join(key)
    }

    pub fn working_path(&self, task_id: &str) -> PathBuf {
        self.prompt_dir(task_id).join("working.md")
    }

    pub fn handoff_md_path(&self, task_id: &str) -> PathBuf {
        self.prompt_dir(task_id).join("handoff.md")
    }

    pub fn handoff_json_path(&self, task_id: &str) -> PathBuf {
        self.prompt_dir(task_id).join("handoff.json")
    }

    /// Create the initial working document for a task.
    pub fn init_working_prompt(&self, task_id: &str, title: &str) -> PromptResult<PathBuf> {
        let data = WorkingPrompt {
            title: title.to_string(),
            ..WorkingPrompt::default()
        };

        let path = self.working_path(task_id);
        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        std::fs::write(&path, data.to_markdown())?;

        *self.cached.lock().unwrap() = Some((task_id.to_string(), data));
        Ok(path)
    }

    /// Deep-merge an update into the working document. Requirements and
    /// constraints are value-sets; context is appended with a separator.
    #[allow(clippy::too_many_arguments)]
    pub fn update_working_prompt(
        &self,
        task_id: &str,
        title: Option<&str>,
        intent: Option<&str>,
        requirements: Option<&[String]>,
        constraints: Option<&[String]>,
        context: Option<&str>,
    ) -> PromptResult<PathBuf> {
        let path = self.working_path(task_id);

        let mut data = {
            let cached = self.cached.lock().unwrap();
            match cached.as_ref() {
                Some((cached_id, data)) if cached_id == task_id => data.clone(),
                _ if path.exists() => WorkingPrompt::from_markdown(&std::fs::read_to_string(&path)?),
                _ => WorkingPrompt::default(),
            }
        };

        if let Some(title) = title {
            data.title = title.to_string();
        }
        if let Some(intent) = intent {
            data.intent = intent.to_string();
        }
        if let Some(reqs) = requirements {
            for req in reqs {
                if !data.requirements.contains(req) {
                    data.requirements.push(req.clone());
                }
            }
        }
        if let Some(cons) = constraints {
            for con in cons {
                if !data.constraints.contains(con) {
                    data.constraints.push(con.clone());
                }
            }
        }
        if let Some(context) = context {
            if data.context.is_empty() {
                data.context = context.to_string();
            } else {
                data.context = format!("{}\n\n{}", data.context, context);
            }
        }
        data.updated_at = Utc::now();

        std::fs::create_dir_all(path.parent().unwrap_or(Path::new(".")))?;
        std::fs::write(&path, data.to_markdown())?;

        if let Some(store) = &self.store {
            store.update_task_status(
                task_id,
                EventType::WorkingPromptUpdated,
                working_prompt_updated_payload(&path.to_string_lossy(), Some(&data.title)),
            )?;
        }

        *self.cached.lock().unwrap() = Some((task_id.to_string(), data));
        Ok(path)
    }

    /// Freeze the working document into `handoff.md` + `handoff.json`.
    /// Fails with `PreconditionNotMet` when no working document exists.
    pub fn freeze_to_handoff(&self, task_id: &str) -> PromptResult<(PathBuf, PathBuf)> {
        let working_path = self.working_path(task_id);
        if !working_path.exists() {
            return Err(PromptError::PreconditionNotMet(task_id.to_string()));
        }

        let data = WorkingPrompt::from_markdown(&std::fs::read_to_string(&working_path)?);

        let handoff_md = format_handoff_md(&data, task_id);
        let handoff_md_path = self.handoff_md_path(task_id);
        std::fs::write(&handoff_md_path, handoff_md)?;

        let spec = ExecutionSpec::from_working(&data);
        let handoff_json_path = self.handoff_json_path(task_id);
        std::fs::write(&handoff_json_path, serde_json::to_string_pretty(&spec).unwrap())?;

        if let Some(store) = &self.store {
            store.update_task_status(
                task_id,
                EventType::HandoffFrozen,
                handoff_frozen_payload(
                    &handoff_md_path.to_string_lossy(),
                    &handoff_json_path.to_string_lossy(),
                ),
            )?;
        }

        Ok((handoff_md_path, handoff_json_path))
    }

    /// Voice-friendly summary of the current working document.
    pub fn working_summary(&self, task_id: &str) -> String {
        let path = self.working_path(task_id);
        if !path.exists() {
            return "No working prompt yet.".to_string();
        }

        let data = match std::fs::read_to_string(&path) {
            Ok(content) => WorkingPrompt::from_markdown(&content),
            Err(_) => return "No working prompt yet.".to_string(),
        };

        let mut parts = vec![format!("Task: {}.", data.title)];
        if !data.intent.is_empty() {
            parts.push(format!("Goal: {}", data.intent));
        }
        if !data.requirements.is_empty() {
            parts.push(format!("{} requirements defined.", data.requirements.len()));
        }
        if !data.constraints.is_empty() {
            parts.push(format!("{} constraints.", data.constraints.len()));
        }
        parts.join(" ")
    }
}

/// Render the frozen handoff as a single-root XML-like document. Kept as
/// valid XML so builders can parse it deterministically.
fn format_handoff_md(data: &WorkingPrompt, task_id: &str) -> String {
    let key: String = task_id.chars().take(8).collect();
    let mut lines = vec![
        "<task>".to_string(),
        format!("  <title>{}</title>", escape_xml(&data.title)),
        String::new(),
        "  <goal>".to_string(),
        format!("    {}", escape_xml(&data.intent)),
        "  </goal>".to_string(),
        String::new(),
        "  <definition_of_done>".to_string(),
    ];
    for req in &data.requirements {
        lines.push(format!("    <item>{}</item>", escape_xml(req)));
    }
    lines.push("  </definition_of_done>".to_string());
    lines.push(String::new());

    lines.push("  <constraints>".to_string());
    for con in STANDARD_CONSTRAINTS.iter().map(|s| s.to_string()).chain(data.constraints.iter().cloned()) {
        lines.push(format!("    <item>{}</item>", escape_xml(&con)));
    }
    lines.push("  </constraints>".to_string());
    lines.push(String::new());

    lines.push("  <expected_artifacts>".to_string());
    lines.push("    <item>diff summary</item>".to_string());
    lines.push("    <item>test output</item>".to_string());
    lines.push("  </expected_artifacts>".to_string());
    lines.push(String::new());

    lines.push("  <gates>".to_string());
    lines.push("    <write_gate>true</write_gate>".to_string());
    lines.push("    <run_gate>true</run_gate>".to_string());
    lines.push("    <destructive_gate>true</destructive_gate>".to_string());
    lines.push("  </gates>".to_string());
    lines.push(String::new());

    lines.push("  <context_pointers>".to_string());
    lines.push(format!("    <artifact path=\".parley/prompts/{key}/handoff.json\"/>"));
    lines.push("  </context_pointers>".to_string());
    lines.push("</task>".to_string());

    lines.join("\n")
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_round_trip() {
        let data = WorkingPrompt {
            title: "Add dark mode".to_string(),
            intent: "Support a dark theme across the app".to_string(),
            requirements: vec!["Toggle in settings".to_string(), "Persist choice".to_string()],
            constraints: vec!["No new dependencies".to_string()],
            context: "Users asked for this repeatedly.".to_string(),
            updated_at: Utc::now(),
        };

        let parsed = WorkingPrompt::from_markdown(&data.to_markdown());
        assert_eq!(parsed.title, data.title);
        assert_eq!(parsed.intent, data.intent);
        assert_eq!(parsed.requirements, data.requirements);
        assert_eq!(parsed.constraints, data.constraints);
        assert_eq!(parsed.context, data.context);
    }

    #[test]
    fn test_update_merges_sets_and_appends_context() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PromptManager::new(dir.path(), None);
        manager.init_working_prompt("task-12345678", "First").unwrap();

        manager
            .update_working_prompt(
                "task-12345678",
                None,
                Some("Do the thing"),
                Some(&["req a".to_string(), "req b".to_string()]),
                None,
                Some("first note"),
            )
            .unwrap();
        manager
            .update_working_prompt(
                "task-12345678",
                None,
                None,
                Some(&["req a".to_string(), "req c".to_string()]),
                None,
                Some("second note"),
            )
            .unwrap();

        let data =
            WorkingPrompt::from_markdown(&std::fs::read_to_string(manager.working_path("task-12345678")).unwrap());
        assert_eq!(data.requirements, vec!["req a", "req b", "req c"]);
        assert_eq!(data.context, "first note\n\nsecond note");
        assert_eq!(data.intent, "Do the thing");
    }

    #[test]
    fn test_freeze_injects_standard_constraints_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PromptManager::new(dir.path(), None);
        manager.init_working_prompt("task-abcdefgh", "Freeze me").unwrap();
        manager
            .update_working_prompt(
                "task-abcdefgh",
                None,
                Some("Ship it"),
                Some(&["works offline".to_string()]),
                Some(&["keep bundle small".to_string()]),
                None,
            )
            .unwrap();

        let (md_path, json_path) = manager.freeze_to_handoff("task-abcdefgh").unwrap();
        let md = std::fs::read_to_string(&md_path).unwrap();
        assert!(md.contains("<item>works offline</item>"));
        assert!(md.contains("<item>keep bundle small</item>"));
        assert_eq!(md.matches("Respect existing style and architecture.").count(), 1);

        let spec: ExecutionSpec =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(spec.goal, "Ship it");
        assert!(spec.definition_of_done.contains(&"works offline".to_string()));
        assert!(spec.constraints.contains(&"keep bundle small".to_string()));
        assert_eq!(
            spec.constraints
                .iter()
                .filter(|c| c.as_str() == "Respect existing style and architecture.")
                .count(),
            1
        );
        assert_eq!(spec.required_artifacts, vec!["diff summary", "test output"]);
        assert_eq!(spec.gates_required, vec!["write_gate", "run_gate"]);
    }

    #[test]
    fn test_freeze_without_working_doc_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PromptManager::new(dir.path(), None);
        let err = manager.freeze_to_handoff("task-missing1").unwrap_err();
        assert!(matches!(err, PromptError::PreconditionNotMet(_)));
    }

    #[test]
    fn test_working_summary() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PromptManager::new(dir.path(), None);
        assert_eq!(manager.working_summary("nope"), "No working prompt yet.");

        manager.init_working_prompt("task-summary1", "Summarized").unwrap();
        manager
            .update_working_prompt(
                "task-summary1",
                None,
                Some("A goal"),
                Some(&["one".to_string()]),
                None,
                None,
            )
            .unwrap();
        let summary = manager.working_summary("task-summary1");
        assert!(summary.contains("Task: Summarized."));
        assert!(summary.contains("Goal: A goal"));
        assert!(summary.contains("1 requirements defined."));
    }
}
