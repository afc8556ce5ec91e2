// Task store
// SQLite persistence for coordinator tasks and their message log. Every
// read and write is scoped by (namespace, session_id).

mod migrations;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use ads_protocol::{TaskSpec, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("migration failed at version {version}: {message}")]
    Migration { version: u32, message: String },
    #[error("unknown task status `{0}` in database")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Scoping key applied to every statement; cross-session reads are refused
/// at the query level by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub namespace: String,
    pub session_id: String,
}

impl Scope {
    pub fn new(namespace: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub task_id: String,
    pub parent_task_id: Option<String>,
    pub namespace: String,
    pub session_id: String,
    pub agent_id: String,
    pub revision: u32,
    pub status: TaskStatus,
    pub spec_json: String,
    pub result_json: Option<String>,
    pub verification_json: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct TaskMessageRow {
    pub id: i64,
    pub task_id: String,
    pub role: String,
    pub kind: Option<String>,
    pub payload: String,
    pub ts: i64,
}

pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl TaskStore {
    /// Open (or create) the store at `path` and bring the schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(conn).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn).await
    }

    async fn bootstrap(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        migrations::apply_all(&mut conn)
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        migrations::current_version(&conn)
    }

    /// Insert or update a task row from its spec. Repeated calls with the
    /// same inputs preserve `created_at` and keep `updated_at`
    /// monotonically non-decreasing.
    pub async fn upsert_task(
        &self,
        scope: &Scope,
        spec: &TaskSpec,
        status: TaskStatus,
    ) -> Result<()> {
        let spec_json = serde_json::to_string(spec)?;
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, parent_task_id, namespace, session_id, agent_id,
                                revision, status, spec_json, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)
             ON CONFLICT(task_id) DO UPDATE SET
                 parent_task_id = excluded.parent_task_id,
                 agent_id = excluded.agent_id,
                 revision = excluded.revision,
                 status = excluded.status,
                 spec_json = excluded.spec_json,
                 updated_at = MAX(tasks.updated_at, excluded.updated_at)
             WHERE tasks.namespace = excluded.namespace
               AND tasks.session_id = excluded.session_id",
            params![
                spec.task_id,
                spec.parent_task_id,
                scope.namespace,
                scope.session_id,
                spec.agent_id,
                spec.revision,
                status.as_str(),
                spec_json,
                now,
            ],
        )?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        scope: &Scope,
        task_id: &str,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1,
                              last_error = COALESCE(?2, last_error),
                              updated_at = ?3
             WHERE task_id = ?4 AND namespace = ?5 AND session_id = ?6",
            params![
                status.as_str(),
                last_error,
                now_ms(),
                task_id,
                scope.namespace,
                scope.session_id
            ],
        )?;
        Ok(())
    }

    pub async fn record_attempt(&self, scope: &Scope, task_id: &str, attempts: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET attempts = ?1, updated_at = ?2
             WHERE task_id = ?3 AND namespace = ?4 AND session_id = ?5",
            params![attempts, now_ms(), task_id, scope.namespace, scope.session_id],
        )?;
        Ok(())
    }

    pub async fn record_result(
        &self,
        scope: &Scope,
        task_id: &str,
        status: TaskStatus,
        result_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1, result_json = ?2, last_error = NULL, updated_at = ?3
             WHERE task_id = ?4 AND namespace = ?5 AND session_id = ?6",
            params![
                status.as_str(),
                result_json,
                now_ms(),
                task_id,
                scope.namespace,
                scope.session_id
            ],
        )?;
        Ok(())
    }

    pub async fn record_verification(
        &self,
        scope: &Scope,
        task_id: &str,
        verification_json: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET verification_json = ?1, updated_at = ?2
             WHERE task_id = ?3 AND namespace = ?4 AND session_id = ?5",
            params![
                verification_json,
                now_ms(),
                task_id,
                scope.namespace,
                scope.session_id
            ],
        )?;
        Ok(())
    }

    /// Null both output columns; used when a rejection verdict sends a task
    /// back for rework.
    pub async fn clear_outputs(&self, scope: &Scope, task_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET result_json = NULL, verification_json = NULL, updated_at = ?1
             WHERE task_id = ?2 AND namespace = ?3 AND session_id = ?4",
            params![now_ms(), task_id, scope.namespace, scope.session_id],
        )?;
        Ok(())
    }

    /// Bump the stored revision; returns the new value.
    pub async fn bump_revision(&self, scope: &Scope, task_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET revision = revision + 1, updated_at = ?1
             WHERE task_id = ?2 AND namespace = ?3 AND session_id = ?4",
            params![now_ms(), task_id, scope.namespace, scope.session_id],
        )?;
        let revision = conn
            .query_row(
                "SELECT revision FROM tasks
                 WHERE task_id = ?1 AND namespace = ?2 AND session_id = ?3",
                params![task_id, scope.namespace, scope.session_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?
            .unwrap_or(1);
        Ok(revision)
    }

    pub async fn get_task(&self, scope: &Scope, task_id: &str) -> Result<Option<TaskRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{SELECT_TASK} WHERE task_id = ?1 AND namespace = ?2 AND session_id = ?3"),
                params![task_id, scope.namespace, scope.session_id],
                row_to_task,
            )
            .optional()?;
        row.transpose()
    }

    /// Tasks in scope, newest first. `active_only` filters out terminal
    /// statuses.
    pub async fn list_tasks(&self, scope: &Scope, active_only: bool) -> Result<Vec<TaskRow>> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            format!(
                "{SELECT_TASK} WHERE namespace = ?1 AND session_id = ?2
                 AND status NOT IN ('DONE', 'FAILED')
                 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "{SELECT_TASK} WHERE namespace = ?1 AND session_id = ?2
                 ORDER BY created_at DESC"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![scope.namespace, scope.session_id], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    pub async fn append_message(
        &self,
        scope: &Scope,
        task_id: &str,
        role: &str,
        kind: Option<&str>,
        payload: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_messages (task_id, namespace, session_id, role, kind, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task_id,
                scope.namespace,
                scope.session_id,
                role,
                kind,
                payload,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub async fn list_messages(&self, scope: &Scope, task_id: &str) -> Result<Vec<TaskMessageRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, role, kind, payload, ts FROM task_messages
             WHERE task_id = ?1 AND namespace = ?2 AND session_id = ?3
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(
            params![task_id, scope.namespace, scope.session_id],
            |row| {
                Ok(TaskMessageRow {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    role: row.get(2)?,
                    kind: row.get(3)?,
                    payload: row.get(4)?,
                    ts: row.get(5)?,
                })
            },
        )?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

const SELECT_TASK: &str = "SELECT task_id, parent_task_id, namespace, session_id, agent_id,
        revision, status, spec_json, result_json, verification_json, attempts, last_error,
        created_at, updated_at FROM tasks";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TaskRow>> {
    let status_raw: String = row.get(6)?;
    let status = match TaskStatus::parse(&status_raw) {
        Some(status) => status,
        None => return Ok(Err(StoreError::UnknownStatus(status_raw))),
    };
    Ok(Ok(TaskRow {
        task_id: row.get(0)?,
        parent_task_id: row.get(1)?,
        namespace: row.get(2)?,
        session_id: row.get(3)?,
        agent_id: row.get(4)?,
        revision: row.get(5)?,
        status,
        spec_json: row.get(7)?,
        result_json: row.get(8)?,
        verification_json: row.get(9)?,
        attempts: row.get(10)?,
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(task_id: &str, agent: &str, revision: u32) -> TaskSpec {
        TaskSpec {
            task_id: task_id.to_string(),
            parent_task_id: None,
            agent_id: agent.to_string(),
            revision,
            goal: "write a haiku".to_string(),
            constraints: vec![],
            deliverables: vec![],
            acceptance_criteria: vec!["5-7-5".to_string()],
            verification: Default::default(),
        }
    }

    fn scope() -> Scope {
        Scope::new("ws-1", "sess-1")
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_created_at() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let scope = scope();
        let spec = spec("t-1", "claude", 1);

        store
            .upsert_task(&scope, &spec, TaskStatus::Pending)
            .await
            .unwrap();
        let first = store.get_task(&scope, "t-1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .upsert_task(&scope, &spec, TaskStatus::Pending)
            .await
            .unwrap();
        let second = store.get_task(&scope, "t-1").await.unwrap().unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn rejection_bumps_revision_and_clears_outputs() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let scope = scope();
        store
            .upsert_task(&scope, &spec("t-1", "claude", 1), TaskStatus::Submitted)
            .await
            .unwrap();
        store
            .record_result(&scope, "t-1", TaskStatus::Submitted, "{\"summary\":\"x\"}")
            .await
            .unwrap();
        store
            .record_verification(&scope, "t-1", "{\"enabled\":true}")
            .await
            .unwrap();

        store
            .set_status(&scope, "t-1", TaskStatus::Rejected, None)
            .await
            .unwrap();
        let revision = store.bump_revision(&scope, "t-1").await.unwrap();
        store.clear_outputs(&scope, "t-1").await.unwrap();

        let row = store.get_task(&scope, "t-1").await.unwrap().unwrap();
        assert_eq!(revision, 2);
        assert_eq!(row.revision, 2);
        assert!(row.result_json.is_none());
        assert!(row.verification_json.is_none());
    }

    #[tokio::test]
    async fn list_tasks_filters_terminal_statuses() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let scope = scope();
        store
            .upsert_task(&scope, &spec("t-1", "claude", 1), TaskStatus::Done)
            .await
            .unwrap();
        store
            .upsert_task(&scope, &spec("t-2", "claude", 1), TaskStatus::InProgress)
            .await
            .unwrap();
        store
            .upsert_task(&scope, &spec("t-3", "codex", 1), TaskStatus::Failed)
            .await
            .unwrap();

        let active = store.list_tasks(&scope, true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "t-2");

        let all = store.list_tasks(&scope, false).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn scope_isolation_is_enforced() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let scope_a = Scope::new("ws-1", "sess-a");
        let scope_b = Scope::new("ws-1", "sess-b");
        store
            .upsert_task(&scope_a, &spec("t-1", "claude", 1), TaskStatus::Pending)
            .await
            .unwrap();

        assert!(store.get_task(&scope_b, "t-1").await.unwrap().is_none());
        assert!(store.list_tasks(&scope_b, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_append_in_order() {
        let store = TaskStore::open_in_memory().await.unwrap();
        let scope = scope();
        store
            .upsert_task(&scope, &spec("t-1", "claude", 1), TaskStatus::Pending)
            .await
            .unwrap();
        store
            .append_message(&scope, "t-1", "agent", Some("raw_output"), "first")
            .await
            .unwrap();
        store
            .append_message(&scope, "t-1", "agent", Some("raw_output"), "second")
            .await
            .unwrap();

        let messages = store.list_messages(&scope, "t-1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "first");
        assert_eq!(messages[1].payload, "second");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = TaskStore::open(&path).await.unwrap();
        let version = store.schema_version().await.unwrap();
        drop(store);

        // Re-opening re-runs the migration list against an up-to-date schema.
        let store = TaskStore::open(&path).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), version);
    }
}
