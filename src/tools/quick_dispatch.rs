//! Command classification and local execution for `quick_dispatch`.
//!
//! Only commands matching a whitelist of read-only queries or trivially
//! safe mutations run locally; anything matching the blocklist (or nothing
//! at all) is bounced back to the model with `requires_full_dispatch`.

use regex::Regex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

const QUICK_QUERY_PATTERNS: [&str; 12] = [
    r"^ls\b",
    r"^tree\b",
    r"^pwd$",
    r"^cat\b",
    r"^head\b",
    r"^tail\b",
    r"^find\b.*-type",
    r"^which\b",
    r"^wc\b",
    r"^git\s+(status|log|diff|branch|show)\b",
    r"^file\b",
    r"^stat\b",
];

const SIMPLE_MUTATION_PATTERNS: [&str; 5] = [
    r#"^mkdir\s+(-p\s+)?"?[\w./_-]+"?$"#,
    r#"^touch\s+"?[\w./_-]+"?$"#,
    r"^cp\b",
    r"^mv\b",
    r"^git\s+(add|checkout|switch|branch\s+-[dD]?)\b",
];

const BLOCKED_PATTERNS: [&str; 10] = [
    r"\brm\b",
    r"\brmdir\b",
    r"\bsudo\b",
    r"--force",
    r"--hard",
    r"\|",
    r"&&",
    r";\s*",
    r">\s*",
    r"\bchmod\b.*777",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

fn query_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&QUICK_QUERY_PATTERNS))
}

fn mutation_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&SIMPLE_MUTATION_PATTERNS))
}

fn blocked_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| compile(&BLOCKED_PATTERNS))
}

/// Classify a command. Blocklist beats everything; then the operation's
/// allow-list must match from the start of the command.
pub fn classify_command(operation: &str, command: &str) -> Result<(), String> {
    for pattern in blocked_patterns() {
        if pattern.is_match(command) {
            return Err(
                "Command contains blocked pattern. Use engage_planner for this operation.".to_string(),
            );
        }
    }

    match operation {
        "query" => {
            if query_patterns().iter().any(|p| p.is_match(command)) {
                Ok(())
            } else {
                Err("Query pattern not recognized. Use engage_planner for safety.".to_string())
            }
        }
        "simple_mutation" => {
            if mutation_patterns().iter().any(|p| p.is_match(command)) {
                Ok(())
            } else {
                Err("Mutation pattern not recognized. Use engage_planner for safety.".to_string())
            }
        }
        _ => Err("Unknown operation type.".to_string()),
    }
}

/// Classify and, if allowed, execute locally with a 30 s timeout.
pub async fn quick_dispatch(operation: &str, command: &str, working_dir: &str) -> Value {
    tracing::debug!(operation, command, "quick_dispatch");

    if let Err(reason) = classify_command(operation, command) {
        tracing::info!(command, reason = %reason, "quick_dispatch rejected");
        return json!({
            "success": false,
            "requires_full_dispatch": true,
            "reason": reason,
            "command": command,
            "hint": "Use engage_planner to properly plan and dispatch this operation.",
        });
    }

    let child = Command::new("sh")
        .args(["-c", command])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return json!({ "success": false, "error": e.to_string(), "command": command });
        }
    };

    match tokio::time::timeout(EXEC_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                json!({
                    "success": true,
                    "output": if stdout.is_empty() { "Done.".to_string() } else { stdout },
                    "command": command,
                    "working_dir": working_dir,
                    "via": "local",
                })
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let error = if stderr.is_empty() {
                    format!("Command failed with code {}", output.status.code().unwrap_or(-1))
                } else {
                    stderr
                };
                json!({
                    "success": false,
                    "error": error,
                    "command": command,
                    "working_dir": working_dir,
                })
            }
        }
        Ok(Err(e)) => json!({ "success": false, "error": e.to_string(), "command": command }),
        Err(_) => json!({
            "success": false,
            "error": "Command timed out (30s limit for quick operations)",
            "command": command,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_allowed() {
        assert!(classify_command("query", "ls -la").is_ok());
        assert!(classify_command("query", "git status").is_ok());
        assert!(classify_command("query", "wc -l src/main.rs").is_ok());
        assert!(classify_command("query", "pwd").is_ok());
    }

    #[test]
    fn test_blocklist_beats_allowlist() {
        assert!(classify_command("query", "ls && rm -rf /").is_err());
        assert!(classify_command("query", "cat foo | grep bar").is_err());
        assert!(classify_command("query", "ls > out.txt").is_err());
        assert!(classify_command("simple_mutation", "mkdir x; rm y").is_err());
        assert!(classify_command("query", "sudo ls").is_err());
        assert!(classify_command("simple_mutation", "git checkout --force main").is_err());
    }

    #[test]
    fn test_unrecognized_patterns_rejected() {
        assert!(classify_command("query", "curl http://example.com").is_err());
        assert!(classify_command("simple_mutation", "dd if=/dev/zero of=x").is_err());
        assert!(classify_command("deploy", "ls").is_err());
    }

    #[test]
    fn test_simple_mutations_allowed() {
        assert!(classify_command("simple_mutation", "mkdir -p src/utils").is_ok());
        assert!(classify_command("simple_mutation", "touch README.md").is_ok());
        assert!(classify_command("simple_mutation", "git add .").is_ok());
    }

    #[tokio::test]
    async fn test_blocked_command_never_executes() {
        let dir = tempfile::tempdir().unwrap();
        let result = quick_dispatch("query", "ls && rm -rf /", &dir.path().to_string_lossy()).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["requires_full_dispatch"], true);
    }

    #[tokio::test]
    async fn test_allowed_query_runs_and_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "x").unwrap();

        let result = quick_dispatch("query", "ls", &dir.path().to_string_lossy()).await;
        assert_eq!(result["success"], true);
        assert!(result["output"].as_str().unwrap().contains("hello.txt"));
        assert_eq!(result["via"], "local");
    }
}
