//! Text heuristics for voice output and voice-recognized input.
//!
//! Voice recognition produces short, loosely punctuated utterances, so the
//! acknowledgment detection here is intentionally permissive.

use regex::Regex;
use std::sync::OnceLock;

/// Return a short, voice-friendly snippet from a longer markdown reply.
///
/// Strips code blocks, headings, bullets, and inline formatting, keeps at
/// most `max_lines` content lines and `max_chars` characters.
pub fn summarize_for_voice(text: &str, max_lines: usize, max_chars: usize) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    static HEADING: OnceLock<Regex> = OnceLock::new();
    static BULLET: OnceLock<Regex> = OnceLock::new();
    static NUMBERED: OnceLock<Regex> = OnceLock::new();
    static INLINE_CODE: OnceLock<Regex> = OnceLock::new();
    static BOLD: OnceLock<Regex> = OnceLock::new();
    static ITALIC: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let heading = HEADING.get_or_init(|| Regex::new(r"^#+\s+").unwrap());
    let bullet = BULLET.get_or_init(|| Regex::new(r"^[-*•]\s+").unwrap());
    let numbered = NUMBERED.get_or_init(|| Regex::new(r"^\d+\.\s+").unwrap());
    let inline_code = INLINE_CODE.get_or_init(|| Regex::new(r"`([^`]*)`").unwrap());
    let bold = BOLD.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
    let italic = ITALIC.get_or_init(|| Regex::new(r"\*([^*]+)\*").unwrap());
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());

    let mut items: Vec<String> = Vec::new();
    let mut in_code_block = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("```") {
            in_code_block = !in_code_block;
            continue;
        }
        if in_code_block {
            continue;
        }

        let line = heading.replace(line, "");
        let line = bullet.replace(&line, "");
        let line = numbered.replace(&line, "");
        let line = inline_code.replace_all(&line, "$1");
        let line = bold.replace_all(&line, "$1");
        let line = italic.replace_all(&line, "$1");

        items.push(line.to_string());
        if items.len() >= max_lines {
            break;
        }
    }

    let summary = spaces.replace_all(items.join(" ").trim(), " ").to_string();
    if summary.chars().count() > max_chars {
        let truncated: String = summary.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", truncated.trim_end())
    } else {
        summary
    }
}

/// Default voice summary: two lines, 220 characters.
pub fn summarize_default(text: &str) -> String {
    summarize_for_voice(text, 2, 220)
}

/// Return true if the user is acknowledging/confirming.
///
/// Used by the relay confirmations ("Anything else before I send?"). A bare
/// "yes" is an ack; "yes, and also..." is new content, not an ack.
pub fn is_acknowledgment(text: &str) -> bool {
    let cleaned = text.trim().to_lowercase();
    if cleaned.is_empty() {
        return true;
    }

    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let non_alnum = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9\s]").unwrap());
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());

    let cleaned = non_alnum.replace_all(&cleaned, "");
    let cleaned = spaces.replace_all(cleaned.trim(), " ").to_string();

    const EXACT: [&str; 16] = [
        "yes", "yeah", "yup", "yep", "ok", "okay", "sure", "done", "no", "nope", "send it",
        "looks good", "thats it", "nothing else", "all good", "go ahead",
    ];
    if EXACT.contains(&cleaned.as_str()) {
        return true;
    }

    let tokens: Vec<&str> = cleaned.split(' ').collect();
    if let Some(first) = tokens.first() {
        if ["yes", "yeah", "yup", "yep"].contains(first) && tokens.len() <= 2 {
            return true;
        }
    }

    if cleaned.starts_with("no ") {
        for phrase in ["thats it", "thats all", "nothing else", "all good", "thanks", "thank you"] {
            if cleaned.contains(phrase) {
                return true;
            }
        }
    }

    if cleaned.contains("send") && cleaned.contains("it") {
        return true;
    }
    if cleaned.contains("looks good") || cleaned.contains("all good") {
        return true;
    }
    if cleaned.contains("thats it") {
        return true;
    }
    if cleaned.contains("nothing") && cleaned.contains("else") {
        return true;
    }

    false
}

/// Return true if the transcript explicitly asks to build/code.
///
/// Freezing a handoff is gated on this; "builder" alone is ambiguous and
/// requires a verb.
pub fn user_intends_builder(transcript: &str) -> bool {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").unwrap());
    let transcript = spaces.replace_all(transcript.trim(), " ").to_lowercase();

    if transcript.is_empty() {
        return false;
    }

    const EXPLICIT: [&str; 8] = [
        "send to builder",
        "send this to the builder",
        "dispatch to builder",
        "start building",
        "start coding",
        "implement it",
        "code it",
        "go ahead and build",
    ];
    if EXPLICIT.iter().any(|p| transcript.contains(p)) {
        return true;
    }
    if transcript.contains("go ahead and implement") {
        return true;
    }

    if transcript.contains("builder")
        && ["send", "dispatch", "start", "run"].iter().any(|v| transcript.contains(v))
    {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_strips_markdown() {
        let text = "## Plan\n\n- **First** do `setup`\n- Then *test*\n```\ncode here\n```\nTrailing line";
        let summary = summarize_default(text);
        assert!(summary.contains("Plan"));
        assert!(summary.contains("First do setup"));
        assert!(!summary.contains("code here"));
        assert!(!summary.contains('*'));
        assert!(!summary.contains('`'));
    }

    #[test]
    fn test_summarize_truncates() {
        let long = "word ".repeat(200);
        let summary = summarize_for_voice(&long, 2, 50);
        assert!(summary.chars().count() <= 50);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_acknowledgments() {
        assert!(is_acknowledgment("yes"));
        assert!(is_acknowledgment("Yes please"));
        assert!(is_acknowledgment("No, that's it."));
        assert!(is_acknowledgment("send it!"));
        assert!(is_acknowledgment("looks good to me"));
        assert!(is_acknowledgment("nothing else"));
        assert!(is_acknowledgment(""));
    }

    #[test]
    fn test_yes_with_content_is_not_ack() {
        assert!(!is_acknowledgment("Yes, I want this to be web-based"));
        assert!(!is_acknowledgment("yes we should also add tests and docs"));
    }

    #[test]
    fn test_builder_intent() {
        assert!(user_intends_builder("okay send to builder"));
        assert!(user_intends_builder("go ahead and implement that"));
        assert!(user_intends_builder("start the builder please"));
        assert!(!user_intends_builder("tell me about the builder"));
        assert!(!user_intends_builder("what do you think"));
        assert!(!user_intends_builder(""));
    }
}
