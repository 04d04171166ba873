//! Ephemeral per-session state: subagent threads, the staged relay draft,
//! the announcement queue, and the waiting-music flags.
//!
//! None of this is persisted; a new voice session starts fresh. Durable
//! task/inbox data lives in the event store. All fields are owned by one
//! mutex so concurrent tool handlers and the safe-point loop never observe
//! partial updates.

pub mod conversation;

pub use conversation::{QuestionParser, SubagentConversation, SubagentQuestion};

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Idle,
    WaitingResponse,
    HasResponse,
    AwaitingUser,
    Error,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Idle => "idle",
            ThreadStatus::WaitingResponse => "waiting_response",
            ThreadStatus::HasResponse => "has_response",
            ThreadStatus::AwaitingUser => "awaiting_user",
            ThreadStatus::Error => "error",
        }
    }
}

/// A single subagent session plus its relay metadata. At most one backend
/// request is in flight per thread.
#[derive(Debug, Clone)]
pub struct SubagentThread {
    pub thread_id: String,
    pub subagent: String,
    pub topic: String,
    pub session_id: String,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_user_message: Option<String>,
    pub last_response: Option<String>,
    pub last_error: Option<String>,
}

impl SubagentThread {
    fn new(subagent: &str, topic: &str, session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            thread_id: uuid::Uuid::new_v4().to_string(),
            subagent: subagent.to_string(),
            topic: topic.to_string(),
            session_id: session_id.to_string(),
            status: ThreadStatus::Idle,
            created_at: now,
            updated_at: now,
            last_user_message: None,
            last_response: None,
            last_error: None,
        }
    }
}

/// Kinds of queued voice announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementKind {
    WaitStarted,
    ResponseReady,
    Info,
    Error,
}

/// A queued single-sentence utterance delivered at a safe point, FIFO.
#[derive(Debug, Clone)]
pub struct PendingAnnouncement {
    pub text: String,
    pub kind: AnnouncementKind,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Staging stage for a relay draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftStage {
    /// Waiting for the user to describe what to send.
    AwaitingDetail,
    /// Waiting for an acknowledgment before sending.
    AwaitingConfirmation,
}

/// A staged user message before relay to a subagent. At most one active
/// draft per session.
#[derive(Debug, Clone)]
pub struct RelayDraft {
    pub target_subagent: String,
    pub project_hint: Option<String>,
    pub topic: String,
    pub message: String,
    pub stage: DraftStage,
}

impl RelayDraft {
    pub fn new(target_subagent: &str, topic: &str) -> Self {
        Self {
            target_subagent: target_subagent.to_string(),
            project_hint: None,
            topic: topic.to_string(),
            message: String::new(),
            stage: DraftStage::AwaitingDetail,
        }
    }
}

#[derive(Default)]
struct SessionStateInner {
    threads: HashMap<String, SubagentThread>,
    waiting_thread_ids: HashSet<String>,
    focused_thread_id: Option<String>,
    announcements: VecDeque<PendingAnnouncement>,
    active_draft: Option<RelayDraft>,
    active_conversation: Option<SubagentConversation>,
    waiting_music_preamble_queued: bool,
    waiting_music_preamble_delivered: bool,
    current_project: Option<String>,
    current_project_path: Option<PathBuf>,
    last_user_transcript: String,
}

/// Shared, mutex-guarded session state.
#[derive(Default)]
pub struct SessionState {
    inner: Mutex<SessionStateInner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Threads ====================

    pub fn create_thread(&self, subagent: &str, topic: &str, session_id: &str, focus: bool) -> SubagentThread {
        let thread = SubagentThread::new(subagent, topic, session_id);
        let mut inner = self.inner.lock().unwrap();
        if focus || inner.focused_thread_id.is_none() {
            inner.focused_thread_id = Some(thread.thread_id.clone());
        }
        inner.threads.insert(thread.thread_id.clone(), thread.clone());
        thread
    }

    pub fn get_thread(&self, thread_id: &str) -> Option<SubagentThread> {
        self.inner.lock().unwrap().threads.get(thread_id).cloned()
    }

    pub fn focused_thread(&self) -> Option<SubagentThread> {
        let inner = self.inner.lock().unwrap();
        inner
            .focused_thread_id
            .as_ref()
            .and_then(|id| inner.threads.get(id))
            .cloned()
    }

    pub fn focused_thread_id(&self) -> Option<String> {
        self.inner.lock().unwrap().focused_thread_id.clone()
    }

    pub fn focus_thread(&self, thread_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.threads.contains_key(thread_id) {
            inner.focused_thread_id = Some(thread_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn list_threads(&self) -> Vec<SubagentThread> {
        let mut threads: Vec<_> = self.inner.lock().unwrap().threads.values().cloned().collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        threads
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().unwrap().threads.len()
    }

    /// Mutate a thread in place. Returns false for unknown ids.
    pub fn update_thread(&self, thread_id: &str, f: impl FnOnce(&mut SubagentThread)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.threads.get_mut(thread_id) {
            Some(thread) => {
                f(thread);
                thread.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn set_thread_waiting(&self, thread_id: &str, waiting: bool) {
        let mut inner = self.inner.lock().unwrap();
        if waiting {
            inner.waiting_thread_ids.insert(thread_id.to_string());
        } else {
            inner.waiting_thread_ids.remove(thread_id);
        }
    }

    pub fn has_waiting_threads(&self) -> bool {
        !self.inner.lock().unwrap().waiting_thread_ids.is_empty()
    }

    // ==================== Announcements ====================

    pub fn enqueue_announcement(&self, text: &str, kind: AnnouncementKind, thread_id: Option<&str>) {
        self.inner.lock().unwrap().announcements.push_back(PendingAnnouncement {
            text: text.to_string(),
            kind,
            thread_id: thread_id.map(String::from),
            created_at: Utc::now(),
        });
    }

    /// Pop at most one announcement (FIFO). The safe-point loop calls this
    /// once per tick.
    pub fn pop_announcement(&self) -> Option<PendingAnnouncement> {
        self.inner.lock().unwrap().announcements.pop_front()
    }

    pub fn announcement_count(&self) -> usize {
        self.inner.lock().unwrap().announcements.len()
    }

    // ==================== Waiting music ====================

    pub fn mark_waiting_music_preamble(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting_music_preamble_queued = true;
        inner.waiting_music_preamble_delivered = true;
    }

    pub fn set_preamble_delivered(&self) {
        self.inner.lock().unwrap().waiting_music_preamble_delivered = true;
    }

    pub fn waiting_music_preamble_delivered(&self) -> bool {
        self.inner.lock().unwrap().waiting_music_preamble_delivered
    }

    // ==================== Draft / conversation ====================

    pub fn set_active_draft(&self, draft: Option<RelayDraft>) {
        self.inner.lock().unwrap().active_draft = draft;
    }

    pub fn active_draft(&self) -> Option<RelayDraft> {
        self.inner.lock().unwrap().active_draft.clone()
    }

    pub fn set_active_conversation(&self, conversation: Option<SubagentConversation>) {
        self.inner.lock().unwrap().active_conversation = conversation;
    }

    pub fn active_conversation(&self) -> Option<SubagentConversation> {
        self.inner.lock().unwrap().active_conversation.clone()
    }

    // ==================== Project selection ====================

    pub fn select_project(&self, name: &str, path: PathBuf) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_project = Some(name.to_string());
        inner.current_project_path = Some(path);
    }

    pub fn current_project(&self) -> Option<(String, PathBuf)> {
        let inner = self.inner.lock().unwrap();
        match (&inner.current_project, &inner.current_project_path) {
            (Some(name), Some(path)) => Some((name.clone(), path.clone())),
            _ => None,
        }
    }

    // ==================== Transcript ====================

    pub fn set_last_user_transcript(&self, transcript: &str) {
        self.inner.lock().unwrap().last_user_transcript = transcript.to_string();
    }

    pub fn last_user_transcript(&self) -> String {
        self.inner.lock().unwrap().last_user_transcript.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_create_and_focus() {
        let state = SessionState::new();
        let t1 = state.create_thread("planner", "auth", "ses_1", true);
        assert_eq!(state.focused_thread_id().as_deref(), Some(t1.thread_id.as_str()));

        let t2 = state.create_thread("brainstormer", "names", "ses_2", false);
        // Not focused, first thread keeps focus.
        assert_eq!(state.focused_thread_id().as_deref(), Some(t1.thread_id.as_str()));

        assert!(state.focus_thread(&t2.thread_id));
        assert_eq!(state.focused_thread_id().as_deref(), Some(t2.thread_id.as_str()));
        assert!(!state.focus_thread("nonexistent"));
    }

    #[test]
    fn test_waiting_set_tracks_threads() {
        let state = SessionState::new();
        let t = state.create_thread("planner", "", "ses_1", true);
        assert!(!state.has_waiting_threads());

        state.set_thread_waiting(&t.thread_id, true);
        assert!(state.has_waiting_threads());

        state.set_thread_waiting(&t.thread_id, false);
        assert!(!state.has_waiting_threads());
    }

    #[test]
    fn test_announcements_fifo() {
        let state = SessionState::new();
        state.enqueue_announcement("first", AnnouncementKind::WaitStarted, None);
        state.enqueue_announcement("second", AnnouncementKind::ResponseReady, Some("t1"));

        assert_eq!(state.announcement_count(), 2);
        assert_eq!(state.pop_announcement().unwrap().text, "first");
        assert_eq!(state.pop_announcement().unwrap().text, "second");
        assert!(state.pop_announcement().is_none());
    }

    #[test]
    fn test_update_thread() {
        let state = SessionState::new();
        let t = state.create_thread("planner", "", "ses_1", true);

        assert!(state.update_thread(&t.thread_id, |thread| {
            thread.status = ThreadStatus::WaitingResponse;
            thread.last_user_message = Some("hello".to_string());
        }));

        let updated = state.get_thread(&t.thread_id).unwrap();
        assert_eq!(updated.status, ThreadStatus::WaitingResponse);
        assert_eq!(updated.last_user_message.as_deref(), Some("hello"));
        assert!(!state.update_thread("missing", |_| {}));
    }

    #[test]
    fn test_single_draft_slot() {
        let state = SessionState::new();
        assert!(state.active_draft().is_none());

        state.set_active_draft(Some(RelayDraft::new("brainstormer", "calculator app")));
        let draft = state.active_draft().unwrap();
        assert_eq!(draft.stage, DraftStage::AwaitingDetail);
        assert_eq!(draft.target_subagent, "brainstormer");

        state.set_active_draft(None);
        assert!(state.active_draft().is_none());
    }
}
