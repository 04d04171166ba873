//! Atomic memory log with a keyword index.
//!
//! Memories append to a JSONL file; a side index maps keywords to entry
//! previews so `lookup_context` subagents can grep something structured.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct MemoryStore {
    log_path: PathBuf,
    index_path: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        let memory_dir = workspace.join("memory");
        Self {
            log_path: memory_dir.join("atomic.jsonl"),
            index_path: memory_dir.join("index.json"),
        }
    }

    /// Append a memory entry and update the keyword index.
    pub async fn add(&self, content: &str, keywords: &[String], importance: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "content": content,
            "keywords": keywords,
            "importance": importance,
        });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(format!("{entry}\n").as_bytes()).await?;

        self.update_index(content, keywords).await?;
        Ok(())
    }

    async fn update_index(&self, content: &str, keywords: &[String]) -> std::io::Result<()> {
        let mut index: Value = tokio::fs::read_to_string(&self.index_path)
            .await
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| json!({ "keywords": {} }));

        let preview: String = content.chars().take(100).collect();
        let timestamp = Utc::now().to_rfc3339();

        if let Some(map) = index.get_mut("keywords").and_then(|k| k.as_object_mut()) {
            for keyword in keywords {
                let list = map.entry(keyword.clone()).or_insert_with(|| json!([]));
                if let Some(list) = list.as_array_mut() {
                    list.push(json!({ "timestamp": timestamp, "preview": preview }));
                }
            }
        }

        tokio::fs::write(&self.index_path, serde_json::to_string_pretty(&index)?).await
    }

    /// Entries whose content or keywords mention the query, newest last.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<Value> {
        let Ok(content) = tokio::fs::read_to_string(&self.log_path).await else {
            return Vec::new();
        };
        let needle = query.to_lowercase();
        content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|entry| {
                let in_content = entry
                    .get("content")
                    .and_then(|c| c.as_str())
                    .map(|c| c.to_lowercase().contains(&needle))
                    .unwrap_or(false);
                let in_keywords = entry
                    .get("keywords")
                    .and_then(|k| k.as_array())
                    .map(|ks| {
                        ks.iter()
                            .filter_map(|k| k.as_str())
                            .any(|k| k.to_lowercase().contains(&needle))
                    })
                    .unwrap_or(false);
                in_content || in_keywords
            })
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store
            .add(
                "We decided on SQLite for persistence",
                &["sqlite".to_string(), "storage".to_string()],
                "high",
            )
            .await
            .unwrap();
        store.add("Dark mode ships next week", &["ui".to_string()], "normal").await.unwrap();

        let hits = store.search("sqlite", 10).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0]["content"].as_str().unwrap().contains("SQLite"));

        let by_keyword = store.search("storage", 10).await;
        assert_eq!(by_keyword.len(), 1);

        assert!(store.search("kubernetes", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_index_accumulates_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.add("first", &["alpha".to_string()], "normal").await.unwrap();
        store
            .add("second", &["alpha".to_string(), "beta".to_string()], "normal")
            .await
            .unwrap();

        let index: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("memory/index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(index["keywords"]["alpha"].as_array().unwrap().len(), 2);
        assert_eq!(index["keywords"]["beta"].as_array().unwrap().len(), 1);
    }
}
