//! Tool schemas and dispatch.
//!
//! Every tool call from the model routes through [`ToolDispatcher::dispatch`].
//! Handlers return a [`ToolResponse`] separating the result the model sees
//! from side-effect signals (voice feedback, ambient audio) the session
//! executes. Handler failures never escape; they come back as
//! `{"error": ...}` results so the dispatch loop keeps serving.

pub mod memory;
pub mod projects;
pub mod quick_dispatch;

use crate::audio::AmbientAudioController;
use crate::builder::BuilderRegistry;
use crate::config::ParleyConfig;
use crate::dashboard::ConversationLogger;
use crate::model::ToolDeclaration;
use crate::prompts::{PromptError, PromptManager};
use crate::relay::{
    AnnouncementKind, DraftStage, QuestionParser, RelayDraft, SessionState, SubagentConversation,
    ThreadStatus,
};
use crate::store::{builder_dispatched_payload, EventStore, EventType, InboxSeverity};
use crate::subagent::{final_response, SubagentBackend};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::voice_text::{is_acknowledgment, summarize_default, user_intends_builder};
use memory::MemoryStore;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// What a tool invocation hands back to the session.
///
/// `result` is what the model sees; the rest are side-effect signals and
/// never leak into `result`.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub result: Value,
    pub voice_feedback: Option<String>,
    pub start_ambient: bool,
    pub stop_ambient: bool,
}

impl ToolResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            voice_feedback: None,
            start_ambient: false,
            stop_ambient: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::ok(json!({ "error": message.into() }))
    }

    pub fn with_voice(mut self, feedback: impl Into<String>) -> Self {
        self.voice_feedback = Some(feedback.into());
        self
    }
}

pub struct ToolDispatcher {
    /// Self-handle for spawning background thread requests.
    weak: std::sync::Weak<ToolDispatcher>,
    store: EventStore,
    prompts: Arc<PromptManager>,
    subagent: Arc<dyn SubagentBackend>,
    builders: Arc<BuilderRegistry>,
    session_state: Arc<SessionState>,
    config: Arc<ParleyConfig>,
    ambient: Arc<AmbientAudioController>,
    logger: Arc<ConversationLogger>,
    memory: MemoryStore,
    workspace: PathBuf,
    current_task_id: Mutex<Option<String>>,
    builder_supervisor: Mutex<Option<(String, Arc<ProcessSupervisor>)>>,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: EventStore,
        prompts: Arc<PromptManager>,
        subagent: Arc<dyn SubagentBackend>,
        builders: Arc<BuilderRegistry>,
        session_state: Arc<SessionState>,
        config: Arc<ParleyConfig>,
        ambient: Arc<AmbientAudioController>,
        logger: Arc<ConversationLogger>,
        workspace: PathBuf,
    ) -> Arc<Self> {
        let memory = MemoryStore::new(&workspace);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            store,
            prompts,
            subagent,
            builders,
            session_state,
            config,
            ambient,
            logger,
            memory,
            workspace,
            current_task_id: Mutex::new(None),
            builder_supervisor: Mutex::new(None),
        })
    }

    pub fn ambient(&self) -> &Arc<AmbientAudioController> {
        &self.ambient
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.session_state
    }

    pub fn set_current_task(&self, task_id: Option<String>) {
        *self.current_task_id.lock().unwrap() = task_id;
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.current_task_id.lock().unwrap().clone()
    }

    /// Route a tool call to its handler. Unknown tools and handler failures
    /// come back as structured errors.
    pub async fn dispatch(&self, name: &str, args: Value) -> ToolResponse {
        self.logger.log_tool_call_start(name, &args);

        let response = match name {
            "list_projects" => self.handle_list_projects().await,
            "select_project" => {
                self.handle_select_project(
                    arg_str(&args, "project_name").unwrap_or_default().as_str(),
                    arg_bool(&args, "auto_start_builder").unwrap_or(true),
                )
                .await
            }
            "start_builder" => self.handle_start_builder().await,
            "create_project" => {
                self.handle_create_project(
                    arg_str(&args, "project_name").unwrap_or_default().as_str(),
                    arg_bool(&args, "init_git").unwrap_or(true),
                    arg_bool(&args, "start_builder_after").unwrap_or(true),
                )
                .await
            }
            "engage_planner" => {
                self.handle_engage_planner(
                    arg_str(&args, "task_description").unwrap_or_default().as_str(),
                    arg_str(&args, "context").unwrap_or_default().as_str(),
                    arg_str(&args, "urgency").unwrap_or_else(|| "normal".to_string()).as_str(),
                )
                .await
            }
            "lookup_context" => {
                self.handle_lookup_context(
                    arg_str(&args, "query").unwrap_or_default().as_str(),
                    arg_str(&args, "scope").unwrap_or_else(|| "both".to_string()).as_str(),
                )
                .await
            }
            "check_status" => {
                self.handle_check_status(arg_bool(&args, "verbose").unwrap_or(false)).await
            }
            "dispatch_to_builder" => {
                self.handle_dispatch_to_builder(
                    arg_str(&args, "plan_file").unwrap_or_default().as_str(),
                    arg_str(&args, "agent").unwrap_or_else(|| "auto".to_string()).as_str(),
                    arg_str(&args, "mode").unwrap_or_else(|| "plan".to_string()).as_str(),
                )
                .await
            }
            "add_to_memory" => {
                self.handle_add_to_memory(
                    arg_str(&args, "content").unwrap_or_default().as_str(),
                    &arg_str_list(&args, "keywords"),
                    arg_str(&args, "importance").unwrap_or_else(|| "normal".to_string()).as_str(),
                )
                .await
            }
            "cancel_task" => {
                self.handle_cancel_task(
                    arg_str(&args, "task_id").unwrap_or_default().as_str(),
                    arg_str(&args, "reason").unwrap_or_default().as_str(),
                )
                .await
            }
            "check_inbox" => {
                self.handle_check_inbox(arg_bool(&args, "include_read").unwrap_or(false)).await
            }
            "acknowledge_inbox" => {
                self.handle_acknowledge_inbox(&arg_str_list(&args, "inbox_ids")).await
            }
            "update_working_prompt" => self.handle_update_working_prompt(&args).await,
            "freeze_prompt" => self.handle_freeze_prompt().await,
            "quick_dispatch" => {
                self.handle_quick_dispatch(
                    arg_str(&args, "operation").unwrap_or_default().as_str(),
                    arg_str(&args, "command").unwrap_or_default().as_str(),
                    arg_str(&args, "working_dir"),
                )
                .await
            }
            "engage_brainstormer" => {
                self.handle_engage_brainstormer(
                    arg_str(&args, "topic")
                        .or_else(|| arg_str(&args, "task_description"))
                        .unwrap_or_default()
                        .as_str(),
                    arg_str(&args, "context").unwrap_or_default().as_str(),
                )
                .await
            }
            "continue_brainstormer" => {
                self.handle_continue_brainstormer(
                    arg_str(&args, "user_response").unwrap_or_default().as_str(),
                )
                .await
            }
            "get_builder_plan" => {
                self.handle_get_builder_plan(arg_str(&args, "task_id").unwrap_or_default().as_str())
                    .await
            }
            "approve_builder_plan" => {
                self.handle_approve_builder_plan(
                    arg_str(&args, "task_id").unwrap_or_default().as_str(),
                    arg_str(&args, "modifications").unwrap_or_default().as_str(),
                )
                .await
            }
            unknown => ToolResponse::error(format!("Unknown tool: {unknown}")),
        };

        self.logger.log_tool_call_complete(name, &response.result);
        response
    }

    // ==================== Project management ====================

    async fn handle_list_projects(&self) -> ToolResponse {
        let root = PathBuf::from(&self.config.root_project_dir);
        ToolResponse::ok(projects::list_projects_result(&root).await)
    }

    async fn handle_select_project(&self, project_name: &str, auto_start: bool) -> ToolResponse {
        if project_name.is_empty() {
            return ToolResponse::error("Missing project name.");
        }

        let root = PathBuf::from(&self.config.root_project_dir);
        let available: Vec<String> =
            projects::list_projects(&root).await.into_iter().map(|e| e.name).collect();
        if available.is_empty() {
            return ToolResponse::error("No projects found in workspace.");
        }

        match projects::select_project(project_name, &available) {
            projects::SelectOutcome::Exact(name) => {
                self.do_select_project(&name, root.join(&name), auto_start, None).await
            }
            projects::SelectOutcome::Fuzzy { name, .. } => {
                self.do_select_project(&name, root.join(&name), auto_start, Some(project_name))
                    .await
            }
            projects::SelectOutcome::Ambiguous(matches) => {
                let preview = matches.join(", ");
                ToolResponse::ok(json!({
                    "status": "needs_clarification",
                    "message": format!("I found multiple projects matching '{project_name}'"),
                    "matches": matches,
                    "say": format!(
                        "I found {} projects that could match: {preview}. Which one did you mean?",
                        matches_count(&preview)
                    ),
                }))
            }
            projects::SelectOutcome::NoMatch => {
                let preview: Vec<&str> = available.iter().take(5).map(String::as_str).collect();
                ToolResponse::ok(json!({
                    "error": format!("No project matches '{project_name}'."),
                    "available_projects": preview,
                    "say": format!(
                        "I couldn't find a project matching '{project_name}'. Available projects are: {}.",
                        preview.join(", ")
                    ),
                }))
            }
        }
    }

    async fn do_select_project(
        &self,
        name: &str,
        path: PathBuf,
        auto_start: bool,
        original_query: Option<&str>,
    ) -> ToolResponse {
        self.session_state.select_project(name, path.clone());

        let mut result = json!({
            "project_name": name,
            "project_path": path.display().to_string(),
        });
        if let Some(query) = original_query {
            result["fuzzy_matched"] = json!(true);
            result["original_query"] = json!(query);
        }

        if auto_start {
            let builder = self.handle_start_builder().await;
            if builder.result.get("status").and_then(|s| s.as_str()) == Some("running") {
                result["summary"] =
                    json!(format!("Selected {name} and started builder. Ready to code!"));
                result["builder_status"] = json!("running");
            } else {
                let error = builder
                    .result
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown status")
                    .to_string();
                result["summary"] = json!(format!("Selected {name}. Builder: {error}"));
                result["builder_status"] = json!("error");
                result["builder_error"] = json!(error);
            }
        } else {
            result["summary"] = json!(format!("Selected project: {name}"));
            result["hint"] = json!("Call start_builder to launch the coding agent.");
        }

        ToolResponse::ok(result)
    }

    async fn handle_start_builder(&self) -> ToolResponse {
        let Some((project_name, project_path)) = self.session_state.current_project() else {
            return ToolResponse::ok(json!({
                "error": "No project selected. Use select_project first.",
                "hint": "Call list_projects to see available options.",
            }));
        };

        // The supervised instance serves the first configured builder entry
        // (by name, for determinism); default port when none is configured.
        let (builder_name, builder_port) = self
            .config
            .builders
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(name, c)| (Some(name.clone()), c.port))
            .unwrap_or((None, 8001));

        // Same project already supervised: nothing to do. A different
        // project means stop and start fresh in the new directory.
        let existing = { self.builder_supervisor.lock().unwrap().clone() };
        if let Some((supervised_project, supervisor)) = existing {
            if supervised_project == project_name && supervisor.is_running().await {
                return ToolResponse::ok(json!({
                    "summary": format!("Builder already running in {project_name}."),
                    "project_name": project_name,
                    "status": "running",
                }));
            }
            supervisor.stop().await;
        }

        let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig {
            role: "builder".to_string(),
            program: "opencode".to_string(),
            port: builder_port,
            working_dir: project_path.clone(),
            start_timeout: Duration::from_secs(30),
            config_dir: None,
            agents_source: None,
            pid_file: self.workspace.join("cache").join("builder.pid"),
        }));

        match supervisor.start().await {
            Ok(()) => {
                *self.builder_supervisor.lock().unwrap() =
                    Some((project_name.clone(), supervisor.clone()));

                // Point the matching builder client at the freshly started
                // instance.
                if let Some(builder) = builder_name
                    .as_deref()
                    .and_then(|name| self.builders.get(name))
                    .or_else(|| self.builders.default_builder())
                {
                    builder.set_base_url(&supervisor.base_url());
                }

                ToolResponse::ok(json!({
                    "summary": format!("Builder started in {project_name}. Ready to code!"),
                    "project_name": project_name,
                    "project_path": project_path.display().to_string(),
                    "port": builder_port,
                    "status": "running",
                }))
            }
            Err(e) => ToolResponse::ok(json!({
                "error": format!("Failed to start builder in {project_name}: {e}"),
                "project_name": project_name,
                "hint": "Check if the builder backend is installed: which opencode",
            })),
        }
    }

    async fn handle_create_project(
        &self,
        project_name: &str,
        init_git: bool,
        start_after: bool,
    ) -> ToolResponse {
        let safe_name = projects::sanitize_project_name(project_name);
        if safe_name.is_empty() {
            return ToolResponse::error("Invalid project name. Use letters, numbers, and dashes.");
        }

        let project_path = PathBuf::from(&self.config.root_project_dir).join(&safe_name);
        if project_path.exists() {
            return ToolResponse::ok(json!({
                "error": format!("Project '{safe_name}' already exists."),
                "hint": "Use select_project to work on it, or choose a different name.",
            }));
        }

        if let Err(e) = tokio::fs::create_dir_all(&project_path).await {
            return ToolResponse::error(format!("Failed to create project: {e}"));
        }
        tracing::info!(path = %project_path.display(), "Created project directory");

        let mut git_initialized = false;
        if init_git {
            match tokio::process::Command::new("git")
                .arg("init")
                .current_dir(&project_path)
                .output()
                .await
            {
                Ok(output) if output.status.success() => git_initialized = true,
                Ok(output) => {
                    tracing::warn!(stderr = %String::from_utf8_lossy(&output.stderr), "git init failed");
                }
                Err(e) => tracing::warn!(error = %e, "git init failed"),
            }
        }

        if start_after {
            self.session_state.select_project(&safe_name, project_path.clone());
            let builder = self.handle_start_builder().await;
            let builder_status = builder
                .result
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown")
                .to_string();
            ToolResponse::ok(json!({
                "summary": format!("Created project '{safe_name}' and started the builder. Ready to code!"),
                "project_name": safe_name,
                "project_path": project_path.display().to_string(),
                "git_initialized": git_initialized,
                "builder_status": builder_status,
            }))
        } else {
            ToolResponse::ok(json!({
                "summary": format!("Created project '{safe_name}'. Use select_project to start working on it."),
                "project_name": safe_name,
                "project_path": project_path.display().to_string(),
                "git_initialized": git_initialized,
                "hint": "Call select_project and start_builder to begin coding.",
            }))
        }
    }

    // ==================== Planning and context ====================

    async fn handle_engage_planner(
        &self,
        task_description: &str,
        context: &str,
        urgency: &str,
    ) -> ToolResponse {
        let mut message = task_description.to_string();
        if !context.is_empty() {
            message = format!("{message}\n\nContext: {context}");
        }
        if urgency != "normal" {
            message = format!("[{} PRIORITY]\n{message}", urgency.to_uppercase());
        }

        let events = self.subagent.engage("planner", &message).await;
        match final_response(&events) {
            Ok(response) => {
                let say = non_empty(summarize_default(&response)).unwrap_or_else(|| head(&response, 500));
                let session_id = self.subagent.cached_session("planner").unwrap_or_default();
                ToolResponse::ok(json!({
                    "status": "active",
                    "session_id": session_id,
                    "response": response,
                    "say": if say.is_empty() { "Okay.".to_string() } else { say },
                }))
            }
            Err(error) => ToolResponse::ok(json!({ "status": "error", "error": error })),
        }
    }

    async fn handle_lookup_context(&self, query: &str, scope: &str) -> ToolResponse {
        let mut result = json!({});

        if scope != "codebase" {
            let hits = self.memory.search(query, 5).await;
            if !hits.is_empty() {
                result["memory"] = json!(hits);
            }
        }

        if scope != "memory" {
            let events = self.subagent.engage("context-reader", query).await;
            match final_response(&events) {
                Ok(context) if !context.is_empty() => {
                    result["context"] = json!(context);
                }
                Ok(_) => {
                    if result.get("memory").is_none() {
                        result["context"] = json!("No relevant context found");
                    }
                }
                Err(error) => {
                    if result.get("memory").is_none() {
                        result["error"] = json!(error);
                    }
                }
            }
        } else if result.get("memory").is_none() {
            result["context"] = json!("No relevant context found");
        }

        ToolResponse::ok(result)
    }

    async fn handle_check_status(&self, verbose: bool) -> ToolResponse {
        let active_tasks = match self.store.get_active_tasks() {
            Ok(tasks) => tasks,
            Err(e) => return ToolResponse::error(e.to_string()),
        };
        let unread = self.store.get_inbox(true, None, 1000).map(|i| i.len()).unwrap_or(0);

        let mut summary = match active_tasks.len() {
            0 => "No active tasks.".to_string(),
            1 => format!(
                "One active task: {}, status {}.",
                active_tasks[0].title, active_tasks[0].status
            ),
            n => format!("{n} active tasks."),
        };
        if unread > 0 {
            summary.push_str(&format!(" {unread} unread notifications."));
        }

        let tasks: Vec<Value> = active_tasks
            .iter()
            .map(|t| {
                let mut entry = json!({
                    "task_id": short(&t.task_id),
                    "title": t.title,
                    "status": t.status.as_str(),
                });
                if verbose {
                    entry["priority"] = json!(t.priority);
                    entry["project_root"] = json!(t.project_root);
                    entry["builder_session_id"] = json!(t.builder_session_id);
                }
                entry
            })
            .collect();

        ToolResponse::ok(json!({
            "tasks": tasks,
            "active_count": active_tasks.len(),
            "unread_notifications": unread,
            "summary": summary,
        }))
    }

    // ==================== Builder dispatch ====================

    async fn handle_dispatch_to_builder(&self, plan_file: &str, agent: &str, mode: &str) -> ToolResponse {
        let task_id = self.current_task_id();

        // Project root: task-specific when available, workspace root otherwise.
        let project_root = task_id
            .as_ref()
            .and_then(|id| self.store.get_task(id).ok().flatten())
            .and_then(|t| t.project_root)
            .or_else(|| Some(self.config.root_project_dir.clone()));

        let plan_path = {
            let direct = PathBuf::from(plan_file);
            if direct.exists() {
                direct
            } else {
                let draft = self.workspace.join("plans").join("drafts").join(plan_file);
                if draft.exists() {
                    draft
                } else {
                    return ToolResponse::error(format!("Plan file not found: {plan_file}"));
                }
            }
        };

        let requested_auto = agent == "auto";
        let agent = if requested_auto {
            let content = tokio::fs::read_to_string(&plan_path).await.unwrap_or_default();
            auto_route(&content).to_string()
        } else {
            agent.to_string()
        };

        // Auto routing picks a tier, not a deployment: when the routed name
        // is not among the configured builders, fall back to whichever one
        // is, rather than failing the dispatch.
        let builder = match self.builders.get(&agent) {
            Some(builder) => builder,
            None if requested_auto => match self.builders.default_builder() {
                Some(builder) => {
                    tracing::info!(
                        routed = %agent,
                        using = %builder.name,
                        "Routed builder not configured; using fallback"
                    );
                    builder
                }
                None => {
                    return ToolResponse::ok(json!({
                        "dispatched": false,
                        "error": "No builders configured",
                        "agent": agent,
                    }));
                }
            },
            None => {
                return ToolResponse::ok(json!({
                    "dispatched": false,
                    "error": format!("Builder {agent} is not configured"),
                    "agent": agent,
                }));
            }
        };
        let agent = builder.name.clone();

        if !builder.health_check().await {
            return ToolResponse::ok(json!({
                "dispatched": false,
                "error": format!("Builder {agent} is not responding"),
                "agent": agent,
            }));
        }

        let task_ref = task_id.clone().unwrap_or_else(|| "unknown".to_string());
        let plan_str = plan_path.to_string_lossy().to_string();
        let dispatch = if mode == "plan" {
            builder
                .dispatch_task_plan_mode(&task_ref, &plan_str, project_root.as_deref())
                .await
        } else {
            builder.dispatch_task(&task_ref, &plan_str, project_root.as_deref()).await
        };

        let dispatch = match dispatch {
            Ok(d) => d,
            Err(e) => {
                return ToolResponse::ok(json!({
                    "dispatched": false,
                    "error": e.to_string(),
                    "agent": agent,
                }));
            }
        };

        // Move the plan from drafts to active.
        let active_dir = self.workspace.join("plans").join("active");
        let _ = tokio::fs::create_dir_all(&active_dir).await;
        let file_name = plan_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let _ = tokio::fs::rename(&plan_path, active_dir.join(&file_name)).await;

        if let Some(task_id) = &task_id {
            if let Err(e) = self.store.update_task_status(
                task_id,
                EventType::BuilderDispatched,
                builder_dispatched_payload(&dispatch.session_id, &agent),
            ) {
                tracing::warn!(error = %e, "Failed to record builder dispatch");
            }
        }

        let plan_name = file_name.to_string_lossy().to_string();
        if mode == "plan" {
            ToolResponse::ok(json!({
                "dispatched": true,
                "task_id": task_id,
                "agent": agent,
                "mode": "plan",
                "session_id": dispatch.session_id,
                "project_root": project_root,
                "awaiting_review": true,
                "message": format!(
                    "Sent to {agent} in plan mode. Use get_builder_plan to review it, then approve_builder_plan to start building."
                ),
            }))
        } else {
            let suffix = project_root
                .as_deref()
                .map(|r| format!(" (project: {r})"))
                .unwrap_or_default();
            ToolResponse::ok(json!({
                "dispatched": true,
                "task_id": task_id,
                "agent": agent,
                "mode": "build",
                "session_id": dispatch.session_id,
                "project_root": project_root,
                "message": format!("Sent to {agent}: {plan_name}{suffix}"),
            }))
        }
    }

    async fn handle_get_builder_plan(&self, task_id: &str) -> ToolResponse {
        self.readopt_builder_sessions(task_id);

        for builder in self.builders.all() {
            if !builder.has_task(task_id) {
                continue;
            }
            match builder.get_plan_response(task_id).await {
                Ok(plan) => {
                    let summary = head(&plan, 500);
                    return ToolResponse::ok(json!({
                        "task_id": task_id,
                        "builder": builder.name,
                        "plan": plan,
                        "summary": summary,
                        "awaiting_approval": true,
                    }));
                }
                Err(e) => {
                    tracing::debug!(builder = %builder.name, error = %e, "No plan from builder");
                }
            }
        }

        ToolResponse::ok(json!({
            "error": format!(
                "No plan found for task {task_id}. Make sure to dispatch with mode='plan' first."
            ),
            "task_id": task_id,
        }))
    }

    async fn handle_approve_builder_plan(&self, task_id: &str, modifications: &str) -> ToolResponse {
        self.readopt_builder_sessions(task_id);

        for builder in self.builders.all() {
            if !builder.has_plan(task_id) {
                continue;
            }
            match builder.approve_and_build(task_id, modifications).await {
                Ok(session_id) => {
                    return ToolResponse::ok(json!({
                        "approved": true,
                        "task_id": task_id,
                        "builder": builder.name,
                        "session_id": session_id,
                        "message": format!(
                            "Building started on {}. I'll notify you when complete.",
                            builder.name
                        ),
                    }))
                    .with_voice("Plan approved. The builder is on it.");
                }
                Err(e) => {
                    tracing::debug!(builder = %builder.name, error = %e, "Approve failed");
                }
            }
        }

        ToolResponse::ok(json!({
            "error": format!(
                "No pending plan found for task {task_id}. Get the plan first with get_builder_plan."
            ),
            "task_id": task_id,
        }))
    }

    /// Sessions live in builder clients in memory; after a restart they are
    /// reconstructed from the task's stored builder_session_id.
    fn readopt_builder_sessions(&self, task_id: &str) {
        if let Ok(Some(task)) = self.store.get_task(task_id) {
            if let Some(session_id) = &task.builder_session_id {
                for builder in self.builders.all() {
                    builder.adopt_session(task_id, session_id, task.project_root.as_deref());
                }
            }
        }
    }

    // ==================== Memory / inbox / tasks ====================

    async fn handle_add_to_memory(
        &self,
        content: &str,
        keywords: &[String],
        importance: &str,
    ) -> ToolResponse {
        if content.is_empty() {
            return ToolResponse::error("Nothing to remember.");
        }
        match self.memory.add(content, keywords, importance).await {
            Ok(()) => {
                ToolResponse::ok(json!({ "saved": true, "message": "Got it, I'll remember that." }))
            }
            Err(e) => ToolResponse::error(format!("Failed to save memory: {e}")),
        }
    }

    async fn handle_cancel_task(&self, task_id: &str, reason: &str) -> ToolResponse {
        if task_id.is_empty() {
            return ToolResponse::error("Missing task_id.");
        }

        let task = match self.store.get_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => return ToolResponse::error(format!("Task not found: {task_id}")),
            Err(e) => return ToolResponse::error(e.to_string()),
        };
        if task.status.is_terminal() {
            return ToolResponse::ok(json!({
                "canceled": false,
                "error": format!("Task already {}.", task.status),
            }));
        }

        // Abort any running builder session first.
        for builder in self.builders.all() {
            if builder.has_task(task_id) {
                builder.cancel_session(task_id).await;
            }
        }

        let reason = if reason.is_empty() { "User requested" } else { reason };
        match self.store.cancel_task(task_id, reason) {
            Ok(_) => ToolResponse::ok(json!({ "canceled": true, "task_id": task_id })),
            Err(e) => ToolResponse::error(e.to_string()),
        }
    }

    async fn handle_check_inbox(&self, include_read: bool) -> ToolResponse {
        let items = match self.store.get_inbox(!include_read, None, 50) {
            Ok(items) => items,
            Err(e) => return ToolResponse::error(e.to_string()),
        };

        if items.is_empty() {
            return ToolResponse::ok(json!({
                "summary": if include_read { "No notifications at all." } else { "No notifications." },
                "count": 0,
            }));
        }

        let blocking: Vec<_> =
            items.iter().filter(|i| i.severity == InboxSeverity::Blocking).collect();
        let errors: Vec<_> = items.iter().filter(|i| i.severity == InboxSeverity::Error).collect();
        let warnings: Vec<_> =
            items.iter().filter(|i| i.severity == InboxSeverity::Warning).collect();
        let info: Vec<_> = items
            .iter()
            .filter(|i| matches!(i.severity, InboxSeverity::Info | InboxSeverity::Success))
            .collect();

        let mut parts = Vec::new();
        if !blocking.is_empty() {
            parts.push(format!("{} blocking", blocking.len()));
        }
        if !errors.is_empty() {
            parts.push(format!(
                "{} {}",
                errors.len(),
                if errors.len() == 1 { "error" } else { "errors" }
            ));
        }
        if !warnings.is_empty() {
            parts.push(format!(
                "{} {}",
                warnings.len(),
                if warnings.len() == 1 { "warning" } else { "warnings" }
            ));
        }
        if !info.is_empty() {
            parts.push(format!("{} info", info.len()));
        }

        let most_important = blocking.first().or(errors.first()).copied().unwrap_or(&items[0]);
        let summary = format!(
            "{} notifications: {}. Most important: {}",
            items.len(),
            parts.join(", "),
            most_important.summary
        );

        ToolResponse::ok(json!({
            "summary": summary,
            "count": items.len(),
            "items": items
                .iter()
                .take(5)
                .map(|i| json!({
                    "inbox_id": i.inbox_id,
                    "severity": i.severity.as_str(),
                    "summary": i.summary,
                }))
                .collect::<Vec<_>>(),
        }))
    }

    async fn handle_acknowledge_inbox(&self, inbox_ids: &[String]) -> ToolResponse {
        if inbox_ids.is_empty() {
            match self.store.acknowledge_all_inbox() {
                Ok(0) => ToolResponse::ok(json!({
                    "acknowledged": 0,
                    "summary": "No notifications to clear.",
                })),
                Ok(count) => ToolResponse::ok(json!({
                    "acknowledged": count,
                    "summary": format!("Cleared all {count} notifications."),
                })),
                Err(e) => ToolResponse::error(e.to_string()),
            }
        } else {
            for id in inbox_ids {
                if let Err(e) = self.store.acknowledge_inbox(id) {
                    return ToolResponse::error(e.to_string());
                }
            }
            ToolResponse::ok(json!({
                "acknowledged": inbox_ids.len(),
                "summary": format!("Acknowledged {} notifications.", inbox_ids.len()),
            }))
        }
    }

    // ==================== Working prompt ====================

    async fn handle_update_working_prompt(&self, args: &Value) -> ToolResponse {
        let Some(task_id) = self.current_task_id() else {
            return ToolResponse::error("No active task.");
        };

        let requirements = arg_str_list(args, "requirements");
        let constraints = arg_str_list(args, "constraints");
        let update = self.prompts.update_working_prompt(
            &task_id,
            arg_str(args, "title").as_deref(),
            arg_str(args, "intent").as_deref(),
            if requirements.is_empty() { None } else { Some(&requirements) },
            if constraints.is_empty() { None } else { Some(&constraints) },
            arg_str(args, "context").as_deref(),
        );

        match update {
            Ok(_) => {
                let summary = self.prompts.working_summary(&task_id);
                ToolResponse::ok(json!({ "updated": true, "summary": summary }))
            }
            Err(e) => ToolResponse::error(e.to_string()),
        }
    }

    async fn handle_freeze_prompt(&self) -> ToolResponse {
        let Some(task_id) = self.current_task_id() else {
            return ToolResponse::error("No active task.");
        };

        // Freezing is the point of no return before dispatch; it only
        // happens on an explicit ask.
        if !user_intends_builder(&self.session_state.last_user_transcript()) {
            return ToolResponse::ok(json!({
                "frozen": false,
                "error": "User has not requested builder dispatch.",
                "say": "I can freeze this into a builder handoff when you explicitly say 'send to builder'.",
            }));
        }

        match self.prompts.freeze_to_handoff(&task_id) {
            Ok((md_path, json_path)) => {
                let parent = md_path.parent().map(|p| p.display().to_string()).unwrap_or_default();
                ToolResponse::ok(json!({
                    "frozen": true,
                    "handoff_md_path": md_path.display().to_string(),
                    "handoff_json_path": json_path.display().to_string(),
                    "summary": format!("Prompt frozen and ready for builder. Files at {parent}"),
                }))
            }
            Err(e @ PromptError::PreconditionNotMet(_)) => {
                ToolResponse::ok(json!({ "frozen": false, "error": e.to_string() }))
            }
            Err(e) => ToolResponse::error(e.to_string()),
        }
    }

    // ==================== Quick dispatch ====================

    async fn handle_quick_dispatch(
        &self,
        operation: &str,
        command: &str,
        working_dir: Option<String>,
    ) -> ToolResponse {
        let cwd = working_dir
            .or_else(|| {
                self.session_state
                    .current_project()
                    .map(|(_, path)| path.display().to_string())
            })
            .unwrap_or_else(|| self.config.root_project_dir.clone());

        ToolResponse::ok(quick_dispatch::quick_dispatch(operation, command, &cwd).await)
    }

    // ==================== Brainstormer relay ====================

    async fn handle_engage_brainstormer(&self, topic: &str, context: &str) -> ToolResponse {
        let mut draft = RelayDraft::new("brainstormer", topic);
        if !context.is_empty() {
            draft.message = context.to_string();
        }
        self.session_state.set_active_draft(Some(draft));

        let say = if topic.is_empty() {
            "What would you like to brainstorm about?".to_string()
        } else {
            format!("What should I tell the brainstormer about {topic}?")
        };
        ToolResponse::ok(json!({ "status": "needs_detail", "say": say }))
    }

    /// Continuation for the brainstormer relay. Routes through, in order:
    /// the active multi-question conversation, the staged draft, or a plain
    /// session continuation.
    pub async fn handle_continue_brainstormer(&self, user_response: &str) -> ToolResponse {
        if self.session_state.active_conversation().is_some() {
            return self.continue_conversation(user_response).await;
        }
        if self.session_state.active_draft().is_some() {
            return self.continue_draft(user_response).await;
        }

        // No staged state: plain continuation with the brainstormer session.
        let events = self.subagent.continue_session("brainstormer", user_response).await;
        match final_response(&events) {
            Ok(response) => {
                let say = non_empty(summarize_default(&response)).unwrap_or_else(|| head(&response, 500));
                ToolResponse::ok(json!({ "status": "active", "response": response, "say": say }))
            }
            Err(error) => ToolResponse::ok(json!({ "status": "error", "error": error })),
        }
    }

    async fn continue_conversation(&self, user_response: &str) -> ToolResponse {
        let Some(mut conv) = self.session_state.active_conversation() else {
            return ToolResponse::error("No active conversation.");
        };

        // Edit flow: pick the question to change.
        if conv.awaiting_edit_question_number {
            let number = user_response
                .trim()
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<usize>()
                .ok();
            match number {
                Some(n) if n >= 1 && n <= conv.total_questions() => {
                    conv.pending_edit_question_number = Some(n);
                    conv.awaiting_edit_question_number = false;
                    conv.awaiting_edit_answer = true;
                    let question = conv.questions[n - 1].text.clone();
                    self.session_state.set_active_conversation(Some(conv));
                    return ToolResponse::ok(json!({
                        "status": "editing",
                        "say": format!("What's the updated answer for question {n}: {question}"),
                    }));
                }
                _ => {
                    let total = conv.total_questions();
                    self.session_state.set_active_conversation(Some(conv));
                    return ToolResponse::ok(json!({
                        "status": "editing",
                        "say": format!("Which question number do you want to change? 1 through {total}."),
                    }));
                }
            }
        }

        // Edit flow: take the replacement answer.
        if conv.awaiting_edit_answer {
            let number = conv.pending_edit_question_number.unwrap_or(0);
            conv.replace_answer(number, user_response.trim());
            conv.awaiting_edit_answer = false;
            conv.pending_edit_question_number = None;
            conv.awaiting_send_confirmation = true;
            self.session_state.set_active_conversation(Some(conv));
            return ToolResponse::ok(json!({
                "status": "awaiting_confirmation",
                "say": "Updated answer recorded. Any other changes before I send?",
            }));
        }

        // Final confirmation before sending everything.
        if conv.awaiting_send_confirmation {
            if is_acknowledgment(user_response) {
                if wants_changes(user_response) {
                    conv.awaiting_edit_question_number = true;
                    let total = conv.total_questions();
                    self.session_state.set_active_conversation(Some(conv));
                    return ToolResponse::ok(json!({
                        "status": "editing",
                        "say": format!("Which question number do you want to change? 1 through {total}."),
                    }));
                }

                // Send it.
                let context = conv.consume_send_context();
                let payload = conv.format_answers_xml(&context);
                let events = self
                    .subagent
                    .send_to_session(&conv.session_id, &conv.subagent_name, &payload)
                    .await;
                self.session_state.set_active_conversation(None);

                return match final_response(&events) {
                    Ok(response) => {
                        let say = non_empty(summarize_default(&response))
                            .unwrap_or_else(|| "Sent. I'll let you know what comes back.".to_string());
                        ToolResponse::ok(json!({
                            "status": "complete",
                            "response": response,
                            "say": say,
                        }))
                    }
                    Err(error) => ToolResponse::ok(json!({ "status": "error", "error": error })),
                };
            }

            // New content while confirming: staged as extra context.
            conv.append_send_context(user_response);
            self.session_state.set_active_conversation(Some(conv));
            return ToolResponse::ok(json!({
                "status": "awaiting_confirmation",
                "say": "Added. Anything else before I send?",
            }));
        }

        // Answer collection: record and advance.
        let more = conv.record_answer(user_response.trim());
        if more {
            let progress = conv.progress_message();
            let question = conv.current_question_message();
            self.session_state.set_active_conversation(Some(conv));
            ToolResponse::ok(json!({
                "status": "needs_input",
                "say": format!("{progress}: {question}"),
            }))
        } else {
            conv.start_send_confirmation();
            self.session_state.set_active_conversation(Some(conv));
            ToolResponse::ok(json!({
                "status": "awaiting_confirmation",
                "say": "That's all the questions. Want to change anything before I send?",
            }))
        }
    }

    async fn continue_draft(&self, user_response: &str) -> ToolResponse {
        let Some(mut draft) = self.session_state.active_draft() else {
            return ToolResponse::error("No active draft.");
        };

        if is_acknowledgment(user_response) {
            // Nothing more to add; send what we have (or just the topic).
            let message = if draft.message.is_empty() {
                draft.topic.clone()
            } else {
                draft.message.clone()
            };
            self.session_state.set_active_draft(None);
            return self
                .send_to_thread(&message, None, Some(&draft.target_subagent), &draft.topic, true, true)
                .await;
        }

        match draft.stage {
            DraftStage::AwaitingDetail => {
                draft.message = user_response.to_string();
                draft.stage = DraftStage::AwaitingConfirmation;
                self.session_state.set_active_draft(Some(draft));
                ToolResponse::ok(json!({
                    "status": "awaiting_confirmation",
                    "say": "Got it. Anything else before I send?",
                }))
            }
            DraftStage::AwaitingConfirmation => {
                // More content, not an ack: fold it into the draft.
                draft.message = if draft.message.is_empty() {
                    user_response.to_string()
                } else {
                    format!("{}\n{}", draft.message, user_response)
                };
                self.session_state.set_active_draft(Some(draft));
                ToolResponse::ok(json!({
                    "status": "awaiting_confirmation",
                    "say": "Added. Anything else before I send?",
                }))
            }
        }
    }

    // ==================== Thread relay ====================

    /// Send a message to a thread; returns `queued` immediately while a
    /// background task runs the backend request.
    pub async fn send_to_thread(
        &self,
        message: &str,
        thread_id: Option<&str>,
        subagent: Option<&str>,
        topic: &str,
        create_new: bool,
        focus: bool,
    ) -> ToolResponse {
        let thread = match thread_id {
            Some(id) => self.session_state.get_thread(id),
            None => self.session_state.focused_thread(),
        };

        let thread = if create_new || thread.is_none() {
            let Some(subagent) = subagent else {
                return ToolResponse::error(
                    "No thread selected. Provide subagent (and optionally topic) to create a new thread.",
                );
            };
            let session_id =
                match self.subagent.create_session(&format!("Parley: {subagent}")).await {
                    Ok(id) => id,
                    Err(e) => return ToolResponse::error(format!("Failed to create session: {e}")),
                };
            self.session_state.create_thread(subagent, topic, &session_id, focus)
        } else {
            thread.expect("checked above")
        };

        tracing::info!(
            thread = %short(&thread.thread_id),
            subagent = %thread.subagent,
            session = %short(&thread.session_id),
            "Thread dispatch"
        );

        self.session_state.update_thread(&thread.thread_id, |t| {
            t.last_user_message = Some(message.to_string());
            t.status = ThreadStatus::WaitingResponse;
        });
        self.session_state.set_thread_waiting(&thread.thread_id, true);

        // The spoken "Okay. Sending..." below doubles as the waiting-music
        // preamble; once delivered, the safe-point loop may start music.
        self.session_state.mark_waiting_music_preamble();

        let dispatcher = self.weak.clone();
        let thread_id = thread.thread_id.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.run_thread_request(&thread_id, &message).await;
            }
        });

        ToolResponse::ok(json!({
            "status": "queued",
            "thread_id": thread.thread_id,
            "session_id": thread.session_id,
            "subagent": thread.subagent,
            "topic": thread.topic,
            "say": format!("Okay. Sending that to the {}.", thread.subagent),
        }))
    }

    /// Background half of `send_to_thread`: run the request, record the
    /// outcome, and queue the announcement / inbox entry.
    async fn run_thread_request(&self, thread_id: &str, message: &str) {
        let Some(thread) = self.session_state.get_thread(thread_id) else {
            return;
        };

        let events = self
            .subagent
            .send_to_session(&thread.session_id, &thread.subagent, message)
            .await;

        match final_response(&events) {
            Err(error) => {
                self.session_state.update_thread(thread_id, |t| {
                    t.status = ThreadStatus::Error;
                    t.last_error = Some(error.clone());
                });
                self.session_state.set_thread_waiting(thread_id, false);
                self.session_state.enqueue_announcement(
                    &format!("The {} hit an error: {error}", thread.subagent),
                    AnnouncementKind::Error,
                    Some(thread_id),
                );
            }
            Ok(response) => {
                let questions = QuestionParser::parse_questions(&response);
                let has_questions = !questions.is_empty();

                self.session_state.update_thread(thread_id, |t| {
                    t.last_response = Some(response.clone());
                    t.status = if has_questions {
                        ThreadStatus::AwaitingUser
                    } else {
                        ThreadStatus::HasResponse
                    };
                });
                self.session_state.set_thread_waiting(thread_id, false);

                tracing::info!(
                    thread = %short(thread_id),
                    subagent = %thread.subagent,
                    questions = questions.len(),
                    "Thread response complete"
                );

                let is_focused =
                    self.session_state.focused_thread_id().as_deref() == Some(thread_id);
                let is_only_thread = self.session_state.thread_count() == 1;
                let auto_relay = is_focused || is_only_thread;

                // Foreground Q&A: the user answers one question at a time
                // through continue_brainstormer.
                if has_questions && auto_relay {
                    let mut conv = SubagentConversation::new(&thread.subagent, &thread.session_id);
                    conv.questions = questions;
                    self.session_state.set_active_conversation(Some(conv));
                }

                let mut item = crate::store::InboxItem::new(
                    InboxSeverity::Info,
                    if thread.topic.is_empty() {
                        format!("{} replied", thread.subagent)
                    } else {
                        format!("{} replied about {}", thread.subagent, thread.topic)
                    },
                    json!({
                        "thread_id": thread_id,
                        "session_id": thread.session_id,
                        "subagent": thread.subagent,
                        "topic": thread.topic,
                    }),
                );
                // Auto-relayed responses are spoken immediately, so their
                // inbox entry starts acknowledged.
                if auto_relay {
                    item.acknowledged_at = Some(chrono::Utc::now());
                }
                if let Err(e) = self.store.add_inbox_item(&item) {
                    tracing::warn!(error = %e, "Failed to add inbox item");
                } else if let Some(ws) = self.logger.ws_handle() {
                    ws.broadcast(
                        "inbox_item",
                        json!({
                            "inbox_id": item.inbox_id,
                            "severity": item.severity.as_str(),
                            "summary": item.summary,
                        }),
                    );
                }

                let snippet = summarize_default(&response);
                let announce = if auto_relay && !snippet.is_empty() {
                    format!("The {} replied: {snippet}.", thread.subagent)
                } else if auto_relay {
                    format!("The {} replied.", thread.subagent)
                } else {
                    format!("The {} replied. It's in your inbox.", thread.subagent)
                };
                self.session_state.enqueue_announcement(
                    &announce,
                    AnnouncementKind::ResponseReady,
                    Some(thread_id),
                );
            }
        }
    }
}

/// "yes"-leaning acknowledgments mean the user wants to make a change at
/// the send-confirmation prompt; "no"/"send it" means go.
fn wants_changes(text: &str) -> bool {
    let cleaned = text.trim().to_lowercase();
    let first = cleaned.split_whitespace().next().unwrap_or("");
    matches!(first, "yes" | "yeah" | "yup" | "yep" | "sure")
}

fn matches_count(preview: &str) -> usize {
    preview.split(", ").count()
}

/// Route a plan to a builder based on its content: complexity keywords,
/// sheer size, or breadth of files touched push it to claude-code.
pub fn auto_route(plan_content: &str) -> &'static str {
    static FILE_REF: OnceLock<Regex> = OnceLock::new();
    let file_ref = FILE_REF.get_or_init(|| Regex::new(r#"path="([^"]+)""#).unwrap());

    let lowered = plan_content.to_lowercase();
    const COMPLEX_KEYWORDS: [&str; 7] = [
        "architecture",
        "refactor",
        "security",
        "design",
        "restructure",
        "migration",
        "overhaul",
    ];
    if COMPLEX_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return "claude-code";
    }
    if plan_content.len() > 5000 {
        return "claude-code";
    }
    if file_ref.captures_iter(plan_content).count() > 5 {
        return "claude-code";
    }
    "opencode-fast"
}

/// Tool declarations registered with the speech model.
pub fn tool_declarations() -> Vec<ToolDeclaration> {
    let schemas: Vec<(&str, &str, Value)> = vec![
        (
            "engage_planner",
            "Engage the planner subagent to refine a task or problem into an actionable prompt. \
             Use when the user describes something worth acting on. The planner will analyze the \
             codebase, ask clarifying questions if needed, and produce an optimized prompt for builders.",
            json!({
                "type": "object",
                "properties": {
                    "task_description": {"type": "string", "description": "What the user wants to accomplish, in your words"},
                    "context": {"type": "string", "description": "Relevant context from the conversation so far"},
                    "urgency": {"type": "string", "enum": ["low", "normal", "high"], "description": "How urgent this task is"}
                },
                "required": ["task_description"]
            }),
        ),
        (
            "lookup_context",
            "Look up relevant context from memory or codebase. Use when you or the user need to \
             recall past decisions, find code, or get background on a topic.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look up - be specific"},
                    "scope": {"type": "string", "enum": ["memory", "codebase", "both"], "description": "Where to search. Default: both"}
                },
                "required": ["query"]
            }),
        ),
        (
            "check_status",
            "Get current status of all running tasks and recent completions. Use when the user \
             asks what's happening or when you need to report progress.",
            json!({
                "type": "object",
                "properties": {
                    "verbose": {"type": "boolean", "description": "Include detailed progress info. Default: false"}
                }
            }),
        ),
        (
            "dispatch_to_builder",
            "Send an optimized prompt to a builder agent for execution. Use when the planner has \
             produced a ready prompt and the user confirms.",
            json!({
                "type": "object",
                "properties": {
                    "plan_file": {"type": "string", "description": "Path to the plan file to execute"},
                    "agent": {"type": "string", "enum": ["auto", "claude-code", "opencode-fast", "opencode-pro"], "description": "Which agent to use. 'auto' routes by complexity."},
                    "mode": {"type": "string", "enum": ["plan", "build"], "description": "'plan' proposes first for review; 'build' implements directly"},
                    "parallel_with": {"type": "string", "description": "Task ID to run in parallel with"}
                },
                "required": ["plan_file"]
            }),
        ),
        (
            "add_to_memory",
            "Save an important decision or context for future recall. Use when significant \
             decisions are made or the user explicitly asks to remember something.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "What to remember - be specific and include context"},
                    "keywords": {"type": "array", "items": {"type": "string"}, "description": "Keywords for later retrieval"},
                    "importance": {"type": "string", "enum": ["low", "normal", "high"], "description": "How important this memory is"}
                },
                "required": ["content"]
            }),
        ),
        (
            "cancel_task",
            "Cancel a running or pending task. Use when the user explicitly asks to stop something.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "description": "ID of the task to cancel"},
                    "reason": {"type": "string", "description": "Why the task is being canceled"}
                },
                "required": ["task_id"]
            }),
        ),
        (
            "check_inbox",
            "Check for unread notifications and alerts. Use when the user asks about updates or \
             what they might have missed.",
            json!({
                "type": "object",
                "properties": {
                    "include_read": {"type": "boolean", "description": "Include already-read notifications. Default: false"}
                }
            }),
        ),
        (
            "acknowledge_inbox",
            "Mark notifications as read. Use when the user indicates they've seen them.",
            json!({
                "type": "object",
                "properties": {
                    "inbox_ids": {"type": "array", "items": {"type": "string"}, "description": "Specific notification IDs. If empty, acknowledges all."}
                }
            }),
        ),
        (
            "update_working_prompt",
            "Update the working prompt with refined task details as they emerge during \
             conversation. Call as you learn more about what the user wants.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Task title (short, descriptive)"},
                    "intent": {"type": "string", "description": "What the user wants to achieve - the goal"},
                    "requirements": {"type": "array", "items": {"type": "string"}, "description": "Specific requirements gathered from conversation"},
                    "constraints": {"type": "array", "items": {"type": "string"}, "description": "Constraints or things to avoid"},
                    "context": {"type": "string", "description": "Additional context relevant to the task"}
                },
                "required": ["title", "intent"]
            }),
        ),
        (
            "freeze_prompt",
            "Freeze the working prompt into a handoff ready for builders. Call when the user \
             confirms they're ready to proceed - signals like 'send it', 'go ahead'.",
            json!({
                "type": "object",
                "properties": {
                    "confirm_summary": {"type": "string", "description": "Brief summary to confirm with the user before freezing"}
                }
            }),
        ),
        (
            "quick_dispatch",
            "Execute quick read-only queries or trivially safe mutations locally. Anything \
             complex is rejected and should go through engage_planner.",
            json!({
                "type": "object",
                "properties": {
                    "operation": {"type": "string", "enum": ["query", "simple_mutation"], "description": "'query' for read-only, 'simple_mutation' for safe writes"},
                    "command": {"type": "string", "description": "The command to execute"},
                    "working_dir": {"type": "string", "description": "Optional working directory (default: project root)"}
                },
                "required": ["operation", "command"]
            }),
        ),
        (
            "engage_brainstormer",
            "Start a brainstorming relay with the brainstormer subagent. Captures what the user \
             wants to explore, confirms, then sends it.",
            json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "description": "What to brainstorm about"},
                    "context": {"type": "string", "description": "Relevant context from the conversation"}
                }
            }),
        ),
        (
            "continue_brainstormer",
            "Continue the active brainstormer exchange with the user's latest answer or \
             confirmation.",
            json!({
                "type": "object",
                "properties": {
                    "user_response": {"type": "string", "description": "The user's latest reply"}
                },
                "required": ["user_response"]
            }),
        ),
        (
            "get_builder_plan",
            "Get the plan a builder produced in plan mode, for user review.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "description": "Task ID to get the plan for"}
                },
                "required": ["task_id"]
            }),
        ),
        (
            "approve_builder_plan",
            "Approve a builder's plan and start implementation, optionally with modifications.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "description": "Task ID to approve"},
                    "modifications": {"type": "string", "description": "Optional modifications before building"}
                },
                "required": ["task_id"]
            }),
        ),
    ];

    schemas
        .into_iter()
        .map(|(name, description, parameters)| ToolDeclaration {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        })
        .collect()
}

// ==================== Arg helpers ====================

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn arg_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(|v| v.as_bool())
}

fn arg_str_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_str()).map(String::from).collect())
        .unwrap_or_default()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn head(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn short(id: &str) -> String {
    id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SubagentQuestion;
    use crate::store::TaskStatus;
    use crate::subagent::{SubagentEvent, SubagentResult};
    use async_trait::async_trait;
    use std::path::Path;

    /// Scripted backend: records sends, returns a canned reply.
    struct FakeBackend {
        sent: Mutex<Vec<(String, String, String)>>,
        reply: String,
    }

    impl FakeBackend {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                reply: reply.to_string(),
            })
        }

        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubagentBackend for FakeBackend {
        async fn create_session(&self, _title: &str) -> SubagentResult<String> {
            Ok("ses_fake".to_string())
        }

        async fn engage(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
            self.send_to_session("ses_fake", agent, message).await
        }

        async fn continue_session(&self, agent: &str, message: &str) -> Vec<SubagentEvent> {
            self.send_to_session("ses_fake", agent, message).await
        }

        async fn send_to_session(
            &self,
            session_id: &str,
            agent: &str,
            message: &str,
        ) -> Vec<SubagentEvent> {
            self.sent.lock().unwrap().push((
                session_id.to_string(),
                agent.to_string(),
                message.to_string(),
            ));
            vec![
                SubagentEvent::Message { content: self.reply.clone() },
                SubagentEvent::Complete { content: self.reply.clone(), duration_ms: 5 },
            ]
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn cached_session(&self, _agent: &str) -> Option<String> {
            Some("ses_fake".to_string())
        }
    }

    fn test_dispatcher_with(backend: Arc<FakeBackend>, root: &Path) -> Arc<ToolDispatcher> {
        let store = EventStore::open_in_memory().unwrap();
        let workspace = root.join(".parley");
        let prompts = Arc::new(PromptManager::new(workspace.clone(), Some(store.clone())));
        let config = Arc::new(ParleyConfig {
            root_project_dir: root.display().to_string(),
            ..ParleyConfig::default()
        });
        ToolDispatcher::new(
            store,
            prompts,
            backend,
            Arc::new(BuilderRegistry::new()),
            Arc::new(SessionState::new()),
            config,
            Arc::new(AmbientAudioController::new()),
            Arc::new(ConversationLogger::new()),
            workspace,
        )
    }

    #[tokio::test]
    async fn test_inbox_severity_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new("ok");
        let dispatcher = test_dispatcher_with(backend, dir.path());

        use crate::store::InboxItem;
        for (severity, summary) in [
            (InboxSeverity::Blocking, "Gate approval needed"),
            (InboxSeverity::Error, "Build failed on auth"),
            (InboxSeverity::Error, "Tests red on parser"),
            (InboxSeverity::Info, "Planner replied"),
        ] {
            dispatcher
                .store
                .add_inbox_item(&InboxItem::new(severity, summary, json!({})))
                .unwrap();
        }

        let response = dispatcher.dispatch("check_inbox", json!({})).await;
        let summary = response.result["summary"].as_str().unwrap();
        assert!(summary.contains("1 blocking"), "summary: {summary}");
        assert!(summary.contains("2 errors"), "summary: {summary}");
        assert!(summary.contains("1 info"), "summary: {summary}");
        assert!(
            summary.contains("Most important: Gate approval needed"),
            "summary: {summary}"
        );
    }

    #[tokio::test]
    async fn test_fuzzy_project_select() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("calculator")).unwrap();
        std::fs::create_dir(dir.path().join("demo")).unwrap();

        let backend = FakeBackend::new("ok");
        let dispatcher = test_dispatcher_with(backend, dir.path());

        let response = dispatcher
            .dispatch(
                "select_project",
                json!({"project_name": "calculator app", "auto_start_builder": false}),
            )
            .await;

        assert_eq!(response.result["project_name"], "calculator");
        assert_eq!(response.result["fuzzy_matched"], true);
        assert_eq!(response.result["original_query"], "calculator app");
    }

    #[tokio::test]
    async fn test_relay_answer_staging_with_edit_flow() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new("Thanks!");
        let dispatcher = test_dispatcher_with(backend.clone(), dir.path());

        let mut conv = SubagentConversation::new("brainstormer", "sess");
        conv.questions = vec![
            SubagentQuestion::new(1, "Who is the target user?"),
            SubagentQuestion::new(2, "What is the platform?"),
        ];
        dispatcher.session_state.set_active_conversation(Some(conv));

        let first = dispatcher.handle_continue_brainstormer("Kids").await;
        assert_eq!(first.result["status"], "needs_input");
        let conv = dispatcher.session_state.active_conversation().unwrap();
        assert!(conv.questions[0].answered);
        assert_eq!(conv.current_question_number(), 2);

        let second = dispatcher.handle_continue_brainstormer("Web").await;
        assert_eq!(second.result["status"], "awaiting_confirmation");

        let choose = dispatcher.handle_continue_brainstormer("yes").await;
        assert!(choose.result["say"].as_str().unwrap().contains("Which question number"));

        let which = dispatcher.handle_continue_brainstormer("2").await;
        assert!(which.result["say"].as_str().unwrap().to_lowercase().contains("updated answer"));

        let updated = dispatcher.handle_continue_brainstormer("Updated platform").await;
        assert!(updated.result["say"].as_str().unwrap().contains("Any other changes"));

        let sent = dispatcher.handle_continue_brainstormer("no").await;
        assert_eq!(sent.result["status"], "complete");

        let sends = backend.sent();
        assert_eq!(sends.len(), 1);
        let (session, agent, payload) = &sends[0];
        assert_eq!(session, "sess");
        assert_eq!(agent, "brainstormer");
        assert!(payload.contains("Updated platform"), "payload: {payload}");
        assert!(payload.contains("<user_responses"));
        assert!(dispatcher.session_state.active_conversation().is_none());
    }

    #[tokio::test]
    async fn test_draft_yes_with_content_is_not_ack() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new("ok");
        let dispatcher = test_dispatcher_with(backend.clone(), dir.path());

        dispatcher.session_state.set_active_draft(Some(RelayDraft {
            target_subagent: "brainstormer".to_string(),
            project_hint: None,
            topic: "calculator app".to_string(),
            message: "I want to brainstorm.".to_string(),
            stage: DraftStage::AwaitingConfirmation,
        }));

        let response = dispatcher
            .handle_continue_brainstormer("Yes, I want this to be web-based")
            .await;
        assert_eq!(response.result["status"], "awaiting_confirmation");
        // Draft retained and grown; nothing sent yet.
        let draft = dispatcher.session_state.active_draft().unwrap();
        assert!(draft.message.contains("web-based"));
        assert!(backend.sent().is_empty());
    }

    #[tokio::test]
    async fn test_draft_sends_on_ack() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new("Here are some ideas");
        let dispatcher = test_dispatcher_with(backend.clone(), dir.path());

        let first = dispatcher
            .dispatch("engage_brainstormer", json!({"topic": "calculator app"}))
            .await;
        assert_eq!(first.result["status"], "needs_detail");

        let second = dispatcher.handle_continue_brainstormer("No, that's it.").await;
        assert_eq!(second.result["status"], "queued");
        assert_eq!(second.result["subagent"], "brainstormer");
        assert!(dispatcher.session_state.active_draft().is_none());

        // The background request runs and records the thread response.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let threads = dispatcher.session_state.list_threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].status, ThreadStatus::HasResponse);
        assert_eq!(dispatcher.session_state.announcement_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher_with(FakeBackend::new("x"), dir.path());
        let response = dispatcher.dispatch("launch_rockets", json!({})).await;
        assert!(response.result["error"].as_str().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_freeze_requires_builder_intent() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher_with(FakeBackend::new("x"), dir.path());

        let task = dispatcher.store.create_task("Freeze test", None, None).unwrap();
        dispatcher.set_current_task(Some(task.task_id.clone()));
        dispatcher.prompts.init_working_prompt(&task.task_id, "Freeze test").unwrap();

        dispatcher.session_state.set_last_user_transcript("tell me more about it");
        let refused = dispatcher.dispatch("freeze_prompt", json!({})).await;
        assert_eq!(refused.result["frozen"], false);

        dispatcher.session_state.set_last_user_transcript("okay send to builder");
        let frozen = dispatcher.dispatch("freeze_prompt", json!({})).await;
        assert_eq!(frozen.result["frozen"], true);

        let updated = dispatcher.store.get_task(&task.task_id).unwrap().unwrap();
        assert_eq!(updated.status, TaskStatus::ReadyToHandoff);
    }

    #[test]
    fn test_auto_route() {
        assert_eq!(auto_route("refactor the auth architecture"), "claude-code");
        assert_eq!(auto_route(&"x".repeat(6000)), "claude-code");
        let many_files = (0..7)
            .map(|i| format!(r#"<artifact path="src/file{i}.rs"/>"#))
            .collect::<String>();
        assert_eq!(auto_route(&many_files), "claude-code");
        assert_eq!(auto_route("add a button to the form"), "opencode-fast");
    }

    #[test]
    fn test_auto_route_names_are_schema_legal() {
        // Whatever auto routing produces must be a name the tool schema
        // declares, or dispatch can never find a builder for it.
        let declarations = tool_declarations();
        let dispatch = declarations.iter().find(|d| d.name == "dispatch_to_builder").unwrap();
        let legal: Vec<&str> = dispatch.parameters["properties"]["agent"]["enum"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();

        for plan in ["add a button", "refactor the auth architecture"] {
            assert!(legal.contains(&auto_route(plan)), "auto_route({plan:?}) outside schema enum");
        }
    }

    #[tokio::test]
    async fn test_auto_dispatch_resolves_configured_builder() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher_with(FakeBackend::new("ok"), dir.path());
        for name in ["claude-code", "opencode-fast", "opencode-pro"] {
            dispatcher.builders.register(
                name,
                Arc::new(crate::builder::BuilderClient::new(name, "http://localhost:59998", "m")),
            );
        }

        let plan_path = dir.path().join("simple-plan.md");
        std::fs::write(&plan_path, "add a button to the form").unwrap();

        let response = dispatcher
            .dispatch(
                "dispatch_to_builder",
                json!({"plan_file": plan_path.to_string_lossy(), "agent": "auto", "mode": "plan"}),
            )
            .await;

        // The routed name resolved to a real registry entry; the dispatch
        // then fails on the (absent) server, not on name lookup.
        assert_eq!(response.result["dispatched"], false);
        assert_eq!(response.result["agent"], "opencode-fast");
        let error = response.result["error"].as_str().unwrap();
        assert!(error.contains("not responding"), "error: {error}");
    }

    #[tokio::test]
    async fn test_auto_dispatch_falls_back_to_first_configured_builder() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher_with(FakeBackend::new("ok"), dir.path());
        dispatcher.builders.register(
            "opencode-pro",
            Arc::new(crate::builder::BuilderClient::new("opencode-pro", "http://localhost:59998", "m")),
        );

        let plan_path = dir.path().join("simple-plan.md");
        std::fs::write(&plan_path, "add a button to the form").unwrap();

        let response = dispatcher
            .dispatch(
                "dispatch_to_builder",
                json!({"plan_file": plan_path.to_string_lossy(), "agent": "auto"}),
            )
            .await;

        // "opencode-fast" is not registered, so auto falls back to the one
        // builder that is.
        assert_eq!(response.result["agent"], "opencode-pro");
        let error = response.result["error"].as_str().unwrap();
        assert!(error.contains("not responding"), "error: {error}");
    }

    #[tokio::test]
    async fn test_explicit_unconfigured_builder_does_not_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = test_dispatcher_with(FakeBackend::new("ok"), dir.path());
        dispatcher.builders.register(
            "opencode-pro",
            Arc::new(crate::builder::BuilderClient::new("opencode-pro", "http://localhost:59998", "m")),
        );

        let plan_path = dir.path().join("plan.md");
        std::fs::write(&plan_path, "whatever").unwrap();

        let response = dispatcher
            .dispatch(
                "dispatch_to_builder",
                json!({"plan_file": plan_path.to_string_lossy(), "agent": "claude-code"}),
            )
            .await;

        assert_eq!(response.result["dispatched"], false);
        let error = response.result["error"].as_str().unwrap();
        assert!(error.contains("not configured"), "error: {error}");
    }

    #[test]
    fn test_tool_declarations_complete() {
        let declarations = tool_declarations();
        let names: Vec<&str> = declarations.iter().map(|d| d.name.as_str()).collect();
        for expected in [
            "engage_planner",
            "lookup_context",
            "check_status",
            "dispatch_to_builder",
            "add_to_memory",
            "cancel_task",
            "check_inbox",
            "acknowledge_inbox",
            "update_working_prompt",
            "freeze_prompt",
            "quick_dispatch",
            "engage_brainstormer",
            "continue_brainstormer",
            "get_builder_plan",
            "approve_builder_plan",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
