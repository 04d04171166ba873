//! Project discovery, fuzzy selection, and creation.

use serde_json::{json, Value};
use std::path::Path;

/// Files/directories whose presence marks a directory as a real project.
const PROJECT_MARKERS: [&str; 7] = [
    ".git",
    "pyproject.toml",
    "package.json",
    "Cargo.toml",
    "go.mod",
    "pom.xml",
    "build.gradle",
];

/// Auto-select threshold for fuzzy matching (0-100 ratio).
const AUTO_SELECT_SCORE: u32 = 85;
/// Candidates below this ratio are not offered at all.
const MATCH_CUTOFF: u32 = 60;

/// A discovered project directory.
#[derive(Debug, Clone)]
pub struct ProjectEntry {
    pub name: String,
    pub has_marker: bool,
}

/// Enumerate direct subdirectories of the workspace root. Marker-bearing
/// projects rank first, then alphabetical.
pub async fn list_projects(root: &Path) -> Vec<ProjectEntry> {
    let mut entries: Vec<ProjectEntry> = Vec::new();

    let Ok(mut dir) = tokio::fs::read_dir(root).await else {
        return entries;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        let has_marker = PROJECT_MARKERS.iter().any(|m| path.join(m).exists());
        entries.push(ProjectEntry { name, has_marker });
    }

    entries.sort_by(|a, b| {
        (!a.has_marker, a.name.to_lowercase()).cmp(&(!b.has_marker, b.name.to_lowercase()))
    });
    entries
}

/// Voice-friendly listing payload.
pub async fn list_projects_result(root: &Path) -> Value {
    if !root.exists() {
        return json!({
            "error": format!("Workspace directory not found: {}", root.display()),
            "projects": [],
        });
    }

    let entries = list_projects(root).await;
    let projects: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let marker_count = entries.iter().filter(|e| e.has_marker).count();

    if projects.is_empty() {
        return json!({
            "summary": format!("No projects found in {}. You can create a new one.", root.display()),
            "projects": [],
            "workspace": root.display().to_string(),
        });
    }

    let preview: Vec<&str> = projects.iter().take(5).copied().collect();
    let summary = if projects.len() <= 5 {
        format!("Found {} projects: {}.", projects.len(), preview.join(", "))
    } else {
        format!(
            "Found {} projects: {}, and {} more.",
            projects.len(),
            preview.join(", "),
            projects.len() - 5
        )
    };

    json!({
        "summary": summary,
        "projects": projects,
        "projects_detailed": entries
            .iter()
            .map(|e| json!({"name": e.name, "has_marker": e.has_marker}))
            .collect::<Vec<_>>(),
        "marker_project_count": marker_count,
        "workspace": root.display().to_string(),
    })
}

/// Result of fuzzy project selection.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    /// Exact directory name match.
    Exact(String),
    /// Single confident fuzzy match.
    Fuzzy { name: String, score: u32 },
    /// Multiple plausible candidates; ask the user.
    Ambiguous(Vec<String>),
    /// Nothing close enough.
    NoMatch,
}

/// Match a spoken project name against the available ones.
///
/// Conversational suffixes ("app", "project") are stripped before scoring.
/// A single candidate, or a top score above the auto-select threshold, wins
/// outright; several mid-score candidates ask for clarification.
pub fn select_project(query: &str, projects: &[String]) -> SelectOutcome {
    if projects.iter().any(|p| p == query) {
        return SelectOutcome::Exact(query.to_string());
    }

    let normalized = normalize_query(query);
    let needle = if normalized.is_empty() { query } else { &normalized };

    let mut scored: Vec<(String, u32)> = projects
        .iter()
        .map(|p| (p.clone(), ratio(needle, p)))
        .filter(|(_, score)| *score >= MATCH_CUTOFF)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    scored.truncate(3);

    match scored.len() {
        0 => SelectOutcome::NoMatch,
        1 => {
            let (name, score) = scored.into_iter().next().expect("len checked");
            SelectOutcome::Fuzzy { name, score }
        }
        _ => {
            // A near-tie at the top means the user has to pick; a clear
            // winner above the threshold is taken without asking.
            let near_tie = scored[0].1.saturating_sub(scored[1].1) < 5;
            if scored[0].1 > AUTO_SELECT_SCORE && !near_tie {
                let (name, score) = scored.into_iter().next().expect("len checked");
                SelectOutcome::Fuzzy { name, score }
            } else {
                SelectOutcome::Ambiguous(scored.into_iter().map(|(name, _)| name).collect())
            }
        }
    }
}

/// Normalized similarity as a 0-100 ratio, tolerant of the query being a
/// phrase containing the project name.
fn ratio(query: &str, candidate: &str) -> u32 {
    let q = query.to_lowercase();
    let c = candidate.to_lowercase();

    let base = (strsim::normalized_levenshtein(&q, &c) * 100.0) as u32;

    // "calculator app" vs "calculator": containment counts for a lot, the
    // way a weighted token ratio would score it.
    let containment = if q.contains(&c) || c.contains(&q) {
        let shorter = q.len().min(c.len()) as f64;
        let longer = q.len().max(c.len()) as f64;
        (90.0 + 10.0 * (shorter / longer)) as u32
    } else {
        0
    };

    base.max(containment)
}

fn normalize_query(query: &str) -> String {
    let mut out = Vec::new();
    for token in query.split_whitespace() {
        let lowered = token.to_lowercase();
        if !matches!(lowered.as_str(), "app" | "project" | "repo" | "repository") {
            out.push(token);
        }
    }
    out.join(" ")
}

/// Sanitize a spoken project name to `[a-z0-9-]`.
pub fn sanitize_project_name(name: &str) -> String {
    name.to_lowercase()
        .replace([' ', '_'], "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_marker_projects_rank_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zebra")).unwrap();
        std::fs::create_dir_all(dir.path().join("aardvark")).unwrap();
        std::fs::create_dir_all(dir.path().join("calculator/.git")).unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();

        let entries = list_projects(dir.path()).await;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "aardvark", "zebra"]);
        assert!(entries[0].has_marker);
    }

    #[test]
    fn test_select_exact() {
        let projects = vec!["calculator".to_string(), "demo".to_string()];
        assert_eq!(
            select_project("calculator", &projects),
            SelectOutcome::Exact("calculator".to_string())
        );
    }

    #[test]
    fn test_select_fuzzy_with_suffix() {
        let projects = vec!["calculator".to_string(), "demo".to_string()];
        match select_project("calculator app", &projects) {
            SelectOutcome::Fuzzy { name, score } => {
                assert_eq!(name, "calculator");
                assert!(score > AUTO_SELECT_SCORE);
            }
            other => panic!("expected fuzzy match, got {other:?}"),
        }
    }

    #[test]
    fn test_select_no_match() {
        let projects = vec!["calculator".to_string(), "demo".to_string()];
        assert_eq!(select_project("spaceship simulator", &projects), SelectOutcome::NoMatch);
    }

    #[test]
    fn test_select_ambiguous() {
        let projects = vec![
            "todo-web".to_string(),
            "todo-api".to_string(),
            "unrelated".to_string(),
        ];
        match select_project("todo", &projects) {
            SelectOutcome::Ambiguous(names) => {
                assert!(names.contains(&"todo-web".to_string()));
                assert!(names.contains(&"todo-api".to_string()));
            }
            // Either candidate winning outright is also acceptable only if
            // confident; "todo" vs both should stay ambiguous.
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_sanitize_project_name() {
        assert_eq!(sanitize_project_name("My Cool App"), "my-cool-app");
        assert_eq!(sanitize_project_name("snake_case_name"), "snake-case-name");
        assert_eq!(sanitize_project_name("weird!@#chars"), "weirdchars");
        assert_eq!(sanitize_project_name("***"), "");
    }
}
