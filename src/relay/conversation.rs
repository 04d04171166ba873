//! Multi-question conversation state for foreground subagent Q&A.
//!
//! When a subagent replies with clarifying questions, the session walks the
//! user through them one at a time, stages answers for confirmation, offers
//! a final edit pass, and then formats everything as a single XML payload
//! sent back to the subagent.

use regex::Regex;
use std::sync::OnceLock;

/// A single question parsed from a subagent response.
#[derive(Debug, Clone)]
pub struct SubagentQuestion {
    /// 1-based question number.
    pub index: usize,
    /// Canonical question text (sent back verbatim).
    pub text: String,
    /// Optional voice-friendly rewrite.
    pub spoken_text: Option<String>,
    pub answered: bool,
    pub answer: Option<String>,
}

impl SubagentQuestion {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            spoken_text: None,
            answered: false,
            answer: None,
        }
    }
}

/// Tracks the question/answer flow with one subagent session.
///
/// Once `all_answers_collected`, the cursor is past the last question and
/// answers only change through the edit flow.
#[derive(Debug, Clone)]
pub struct SubagentConversation {
    pub subagent_name: String,
    pub session_id: String,
    pub questions: Vec<SubagentQuestion>,
    /// 0-based index into `questions`.
    pub current_question_index: usize,
    pub all_answers_collected: bool,

    // Staged answer confirmation for the current question.
    pub pending_answer: Option<String>,
    pub awaiting_answer_confirmation: bool,

    // Confirmation before sending all answers.
    pub awaiting_send_confirmation: bool,
    pub pending_send_context: Option<String>,

    // Final review/edit flow before sending.
    pub awaiting_edit_question_number: bool,
    pub awaiting_edit_answer: bool,
    pub pending_edit_question_number: Option<usize>,
}

impl SubagentConversation {
    pub fn new(subagent_name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            subagent_name: subagent_name.into(),
            session_id: session_id.into(),
            questions: Vec::new(),
            current_question_index: 0,
            all_answers_collected: false,
            pending_answer: None,
            awaiting_answer_confirmation: false,
            awaiting_send_confirmation: false,
            pending_send_context: None,
            awaiting_edit_question_number: false,
            awaiting_edit_answer: false,
            pending_edit_question_number: None,
        }
    }

    pub fn total_questions(&self) -> usize {
        self.questions.len()
    }

    /// 1-based question number for user display.
    pub fn current_question_number(&self) -> usize {
        self.current_question_index + 1
    }

    pub fn questions_remaining(&self) -> usize {
        self.questions.iter().filter(|q| !q.answered).count()
    }

    pub fn current_question(&self) -> Option<&SubagentQuestion> {
        self.questions.get(self.current_question_index)
    }

    /// Record an answer to the current question and advance. Returns true if
    /// more questions remain.
    pub fn record_answer(&mut self, answer: &str) -> bool {
        if let Some(current) = self.questions.get_mut(self.current_question_index) {
            current.answered = true;
            current.answer = Some(answer.to_string());
            self.current_question_index += 1;
        }

        if self.current_question_index >= self.questions.len() {
            self.all_answers_collected = true;
            return false;
        }
        true
    }

    /// Replace the answer for a specific question (1-based).
    pub fn replace_answer(&mut self, question_number: usize, answer: &str) -> bool {
        if question_number < 1 || question_number > self.questions.len() {
            return false;
        }
        let question = &mut self.questions[question_number - 1];
        question.answered = true;
        question.answer = Some(answer.to_string());
        true
    }

    /// Stage an answer without committing, supporting the
    /// "Anything else to add?" confirmation.
    pub fn stage_answer(&mut self, answer: &str) {
        self.pending_answer = Some(answer.to_string());
        self.awaiting_answer_confirmation = true;
    }

    pub fn append_pending(&mut self, extra: &str) {
        let extra = extra.trim();
        if extra.is_empty() {
            return;
        }
        self.pending_answer = Some(match self.pending_answer.take() {
            Some(existing) => format!("{existing}\n{extra}"),
            None => extra.to_string(),
        });
        self.awaiting_answer_confirmation = true;
    }

    /// Commit the staged answer and advance. Returns true if more questions
    /// remain.
    pub fn commit_pending_answer(&mut self) -> bool {
        let answer = self.pending_answer.take().unwrap_or_default();
        self.awaiting_answer_confirmation = false;
        self.record_answer(answer.trim())
    }

    /// Enter the final send-confirmation stage.
    pub fn start_send_confirmation(&mut self) {
        self.awaiting_send_confirmation = true;
        self.pending_send_context = None;
        self.awaiting_edit_question_number = false;
        self.awaiting_edit_answer = false;
        self.pending_edit_question_number = None;
    }

    /// Stage additional free-form context before sending answers.
    pub fn append_send_context(&mut self, extra: &str) {
        let extra = extra.trim();
        if extra.is_empty() {
            return;
        }
        self.pending_send_context = Some(match self.pending_send_context.take() {
            Some(existing) => format!("{existing}\n{extra}"),
            None => extra.to_string(),
        });
        self.awaiting_send_confirmation = true;
    }

    pub fn consume_send_context(&mut self) -> String {
        self.pending_send_context.take().unwrap_or_default().trim().to_string()
    }

    pub fn intro_message(&self) -> String {
        match self.total_questions() {
            1 => "They have one question.".to_string(),
            n => format!("They have {n} questions."),
        }
    }

    /// Current question text for voice delivery. Numbering is the caller's
    /// job so prompts can read naturally ("First question:").
    pub fn current_question_message(&self) -> String {
        match self.current_question() {
            Some(q) => q.spoken_text.clone().unwrap_or_else(|| q.text.clone()),
            None => "All questions have been answered.".to_string(),
        }
    }

    pub fn progress_message(&self) -> String {
        format!("Question {} of {}", self.current_question_number(), self.total_questions())
    }

    /// Format all collected answers as single-root XML.
    pub fn format_answers_xml(&self, additional_context: &str) -> String {
        let mut lines = vec![format!(
            "<user_responses session_id=\"{}\" subagent=\"{}\">",
            escape_xml(&self.session_id),
            escape_xml(&self.subagent_name)
        )];

        for q in &self.questions {
            if q.answered {
                lines.push(format!("  <response question_number=\"{}\">", q.index));
                lines.push(format!(
                    "    <original_question>{}</original_question>",
                    escape_xml(&q.text)
                ));
                lines.push(format!(
                    "    <user_answer>{}</user_answer>",
                    escape_xml(q.answer.as_deref().unwrap_or(""))
                ));
                lines.push("  </response>".to_string());
            }
        }

        if additional_context.is_empty() {
            lines.push("  <additional_context>None provided</additional_context>".to_string());
        } else {
            lines.push(format!(
                "  <additional_context>{}</additional_context>",
                escape_xml(additional_context)
            ));
        }

        lines.push("</user_responses>".to_string());
        lines.join("\n")
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Parse questions out of a subagent response.
///
/// Handles labeled ("Question 1:"), numbered ("1."/"2)"), bulleted ("-"/"*"),
/// and plain lines ending in "?". List-like matches go through a
/// question-likeness check so ordinary bullet lists aren't misread.
pub struct QuestionParser;

impl QuestionParser {
    fn labeled_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?m)^\s*[Qq]uestion\s*(\d+)\s*[:.]\s*(.+?)\s*$").unwrap())
    }

    fn numbered_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)\s*[.)]\s*(.+?)\s*$").unwrap())
    }

    fn bulleted_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s*(.+?)\s*$").unwrap())
    }

    fn single_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?m)^(.+?\?)\s*$").unwrap())
    }

    fn looks_like_question(text: &str) -> bool {
        let candidate = text.trim();
        if candidate.len() < 8 {
            return false;
        }
        if candidate.contains('?') {
            return true;
        }
        const PREFIXES: [&str; 23] = [
            "what ", "which ", "how ", "why ", "when ", "where ", "who ", "can ", "could ",
            "would ", "should ", "do ", "does ", "did ", "is ", "are ", "will ", "tell me",
            "describe", "share", "confirm", "please", "name ",
        ];
        let lowered = candidate.to_lowercase();
        PREFIXES.iter().any(|p| lowered.starts_with(p))
    }

    pub fn parse_questions(response: &str) -> Vec<SubagentQuestion> {
        let mut questions = Vec::new();

        let labeled: Vec<_> = Self::labeled_re()
            .captures_iter(response)
            .map(|c| c[2].trim().to_string())
            .collect();
        if !labeled.is_empty() {
            for text in labeled {
                if Self::looks_like_question(&text) {
                    questions.push(SubagentQuestion::new(questions.len() + 1, text));
                }
            }
            return questions;
        }

        let numbered: Vec<_> = Self::numbered_re()
            .captures_iter(response)
            .map(|c| c[2].trim().to_string())
            .collect();
        if !numbered.is_empty() {
            for text in numbered {
                if Self::looks_like_question(&text) {
                    questions.push(SubagentQuestion::new(questions.len() + 1, text));
                }
            }
            return questions;
        }

        let bulleted: Vec<_> = Self::bulleted_re()
            .captures_iter(response)
            .map(|c| c[1].trim().to_string())
            .collect();
        if !bulleted.is_empty() {
            for text in bulleted {
                if Self::looks_like_question(&text) {
                    questions.push(SubagentQuestion::new(questions.len() + 1, text));
                }
            }
            return questions;
        }

        for caps in Self::single_re().captures_iter(response) {
            let text = caps[1].trim().to_string();
            if text.len() > 10 {
                questions.push(SubagentQuestion::new(questions.len() + 1, text));
            }
        }
        questions
    }

    pub fn is_asking_questions(response: &str) -> bool {
        if !response.contains('?') {
            return false;
        }
        !Self::parse_questions(response).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbered_questions() {
        let response = "Before I plan this:\n1. What platform are you targeting?\n2. Who is the audience?";
        let questions = QuestionParser::parse_questions(response);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].index, 1);
        assert_eq!(questions[0].text, "What platform are you targeting?");
    }

    #[test]
    fn test_parse_labeled_questions() {
        let response = "Question 1: What language do you prefer?\nQuestion 2: Should tests be included?";
        let questions = QuestionParser::parse_questions(response);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[1].text, "Should tests be included?");
    }

    #[test]
    fn test_plain_bullet_list_is_not_questions() {
        let response = "Here's the plan:\n- Set up the repo\n- Write the parser\n- Add tests";
        assert!(QuestionParser::parse_questions(response).is_empty());
        assert!(!QuestionParser::is_asking_questions(response));
    }

    #[test]
    fn test_single_question_line() {
        let response = "Nice idea. Do you want dark mode support as well?";
        let questions = QuestionParser::parse_questions(response);
        assert_eq!(questions.len(), 1);
    }

    #[test]
    fn test_answer_flow_and_cursor() {
        let mut conv = SubagentConversation::new("planner", "ses_1");
        conv.questions = vec![
            SubagentQuestion::new(1, "Who is the target user?"),
            SubagentQuestion::new(2, "What is the platform?"),
        ];

        assert!(conv.record_answer("Kids"));
        assert_eq!(conv.current_question_number(), 2);
        assert!(conv.questions[0].answered);

        assert!(!conv.record_answer("Web"));
        assert!(conv.all_answers_collected);
        assert_eq!(conv.questions_remaining(), 0);
    }

    #[test]
    fn test_replace_answer_bounds() {
        let mut conv = SubagentConversation::new("planner", "ses_1");
        conv.questions = vec![SubagentQuestion::new(1, "What is the platform?")];
        conv.record_answer("Desktop");

        assert!(conv.replace_answer(1, "Web"));
        assert_eq!(conv.questions[0].answer.as_deref(), Some("Web"));
        assert!(!conv.replace_answer(0, "nope"));
        assert!(!conv.replace_answer(2, "nope"));
    }

    #[test]
    fn test_staged_answer_commit() {
        let mut conv = SubagentConversation::new("planner", "ses_1");
        conv.questions = vec![
            SubagentQuestion::new(1, "Who is the target user?"),
            SubagentQuestion::new(2, "What is the platform?"),
        ];

        conv.stage_answer("Kids");
        conv.append_pending("specifically ages 8-12");
        assert!(conv.awaiting_answer_confirmation);

        assert!(conv.commit_pending_answer());
        assert_eq!(
            conv.questions[0].answer.as_deref(),
            Some("Kids\nspecifically ages 8-12")
        );
        assert!(!conv.awaiting_answer_confirmation);
    }

    #[test]
    fn test_xml_payload_includes_answers_and_context() {
        let mut conv = SubagentConversation::new("brainstormer", "ses_2");
        conv.questions = vec![
            SubagentQuestion::new(1, "Who is the target user?"),
            SubagentQuestion::new(2, "What is the platform?"),
        ];
        conv.record_answer("Kids");
        conv.record_answer("Web & mobile");

        let xml = conv.format_answers_xml("Budget is small");
        assert!(xml.starts_with("<user_responses"));
        assert!(xml.contains("subagent=\"brainstormer\""));
        assert!(xml.contains("<user_answer>Kids</user_answer>"));
        assert!(xml.contains("Web &amp; mobile"));
        assert!(xml.contains("<additional_context>Budget is small</additional_context>"));

        let no_context = conv.format_answers_xml("");
        assert!(no_context.contains("<additional_context>None provided</additional_context>"));
    }
}
