// Thread records
// Persisted `<userId>::<agentId>` → {thread_id, cwd}, written through after
// every successful turn so conversations survive process restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    /// The cwd in effect when this thread id was last produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

pub struct ThreadStore {
    path: PathBuf,
    records: RwLock<HashMap<String, ThreadRecord>>,
}

fn key(user_id: &str, agent_id: &str) -> String {
    format!("{user_id}::{agent_id}")
}

impl ThreadStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            records: RwLock::new(records),
        }
    }

    pub async fn get(&self, user_id: &str, agent_id: &str) -> Option<ThreadRecord> {
        self.records.read().await.get(&key(user_id, agent_id)).cloned()
    }

    pub async fn set(&self, user_id: &str, agent_id: &str, record: ThreadRecord) {
        let snapshot = {
            let mut records = self.records.write().await;
            records.insert(key(user_id, agent_id), record);
            records.clone()
        };
        self.persist(&snapshot);
    }

    /// Drop every record for a user (explicit session reset).
    pub async fn clear_user(&self, user_id: &str) {
        let prefix = format!("{user_id}::");
        let snapshot = {
            let mut records = self.records.write().await;
            records.retain(|k, _| !k.starts_with(&prefix));
            records.clone()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, records: &HashMap<String, ThreadRecord>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(records) {
            Ok(content) => {
                if let Err(err) = atomic_write(&self.path, &content) {
                    tracing::warn!(error = %err, "failed to persist thread records");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize thread records"),
        }
    }
}

/// Atomic write using temp file and rename.
fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("threads.json");

        let store = ThreadStore::load(&path);
        store
            .set(
                "u-1",
                "codex",
                ThreadRecord {
                    thread_id: "th-1".to_string(),
                    cwd: Some(PathBuf::from("/work")),
                },
            )
            .await;
        drop(store);

        let store = ThreadStore::load(&path);
        let record = store.get("u-1", "codex").await.unwrap();
        assert_eq!(record.thread_id, "th-1");
        assert_eq!(record.cwd, Some(PathBuf::from("/work")));
    }

    #[tokio::test]
    async fn clear_user_removes_only_that_user() {
        let dir = tempdir().unwrap();
        let store = ThreadStore::load(dir.path().join("threads.json"));
        let record = ThreadRecord {
            thread_id: "th".to_string(),
            cwd: None,
        };
        store.set("u-1", "codex", record.clone()).await;
        store.set("u-2", "codex", record).await;

        store.clear_user("u-1").await;
        assert!(store.get("u-1", "codex").await.is_none());
        assert!(store.get("u-2", "codex").await.is_some());
    }
}
