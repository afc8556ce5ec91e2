// Schema migrations
// A numbered, append-only list. Each migration function is idempotent on
// its own (IF NOT EXISTS, or a table_info probe before ALTER TABLE), and a
// marker table tracks the highest applied version. Each missing migration
// runs inside its own transaction.

use std::collections::HashSet;

use rusqlite::{Connection, Transaction};

use crate::StoreError;

type MigrationFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

const MIGRATIONS: &[(u32, MigrationFn)] = &[
    (1, migrate_tasks),
    (2, migrate_task_messages),
    (3, migrate_archived_at),
];

pub fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, u32>(0),
    )?;
    Ok(version)
}

pub fn apply_all(conn: &mut Connection) -> Result<(), StoreError> {
    let applied = current_version(conn)?;
    for (version, migration) in MIGRATIONS {
        if *version <= applied {
            continue;
        }
        let tx = conn.transaction()?;
        migration(&tx).map_err(|err| StoreError::Migration {
            version: *version,
            message: err.to_string(),
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied task store migration");
    }
    Ok(())
}

fn migrate_tasks(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            parent_task_id TEXT,
            namespace TEXT NOT NULL,
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            result_json TEXT,
            verification_json TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_scope
         ON tasks (namespace, session_id, status)",
        [],
    )?;
    Ok(())
}

fn migrate_task_messages(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute(
        "CREATE TABLE IF NOT EXISTS task_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL REFERENCES tasks(task_id),
            namespace TEXT NOT NULL,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            kind TEXT,
            payload TEXT NOT NULL,
            ts INTEGER NOT NULL
        )",
        [],
    )?;
    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_task_messages_task
         ON task_messages (namespace, session_id, task_id)",
        [],
    )?;
    Ok(())
}

// Kept for schema compatibility with UI-side task consumers; the
// coordinator never reads this column.
fn migrate_archived_at(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    let existing: HashSet<String> = {
        let mut stmt = tx.prepare("PRAGMA table_info(tasks)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.collect::<Result<HashSet<_>, _>>()?
    };
    if !existing.contains("archived_at") {
        tx.execute("ALTER TABLE tasks ADD COLUMN archived_at INTEGER", [])?;
    }
    Ok(())
}
