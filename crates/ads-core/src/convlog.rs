// Conversation log
// Optional per-session JSONL log of turns under the state directory.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ConversationEntry<'a> {
    pub ts: chrono::DateTime<Utc>,
    pub role: &'a str,
    pub agent_id: &'a str,
    pub text: &'a str,
}

pub struct ConversationLogger {
    path: PathBuf,
}

impl ConversationLogger {
    pub fn new(dir: PathBuf, user_id: &str) -> Self {
        let sanitized: String = user_id
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        Self {
            path: dir.join(format!("conversation-{sanitized}.jsonl")),
        }
    }

    pub fn append(&self, role: &str, agent_id: &str, text: &str) {
        let entry = ConversationEntry {
            ts: Utc::now(),
            role,
            agent_id,
            text,
        };
        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            tracing::warn!(error = %err, path = %self.path.display(), "conversation log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_jsonl_lines() {
        let dir = tempdir().unwrap();
        let logger = ConversationLogger::new(dir.path().to_path_buf(), "user@host");
        logger.append("user", "codex", "hello");
        logger.append("agent", "codex", "hi");

        let content = std::fs::read_to_string(dir.path().join("conversation-user_host.jsonl"))
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"role\":\"user\""));
    }
}
