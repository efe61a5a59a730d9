//! Backlog schema and SQL queries.
//!
//! The backlog database is owned by whoever fills it with prompts; these
//! statements only create the tables when they are missing so a fresh
//! SQLite file is usable.

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid      TEXT,
    "order"   INTEGER NOT NULL DEFAULT 0,
    prompt    TEXT    NOT NULL,
    status    INTEGER NOT NULL DEFAULT 0,
    createdat TEXT    NOT NULL DEFAULT (datetime('now')),
    updatedat TEXT    NOT NULL DEFAULT (datetime('now'))
)
"#;

/// SQL schema for creating the system_settings table.
pub const CREATE_SYSTEM_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS system_settings (
    name       TEXT    PRIMARY KEY,
    value      INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT    NOT NULL DEFAULT (datetime('now'))
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_status_order ON tasks(status, "order", id)
"#;

/// Returns all schema statements in execution order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_TASKS_TABLE,
        CREATE_SYSTEM_SETTINGS_TABLE,
        CREATE_INDEXES,
    ]
}

/// Next runnable task: READY or IN_PROGRESS, lowest order then lowest id.
pub const SELECT_NEXT_READY_TASK: &str = r#"
SELECT id, uuid, "order", prompt, status
FROM tasks
WHERE status IN (0, 4)
ORDER BY "order" ASC, id ASC
LIMIT 1
"#;

pub const UPDATE_TASK_STATUS: &str =
    "UPDATE tasks SET status = ?1, updatedat = datetime('now') WHERE id = ?2";

pub const SELECT_TASK_STATUS: &str = "SELECT status FROM tasks WHERE id = ?1";

pub const INSERT_TASK: &str =
    r#"INSERT INTO tasks (uuid, "order", prompt, status) VALUES (?1, ?2, ?3, ?4)"#;

pub const SELECT_SETTING: &str = "SELECT value FROM system_settings WHERE name = ?1";

pub const UPSERT_SETTING: &str = r#"
INSERT INTO system_settings (name, value, updated_at)
VALUES (?1, ?2, datetime('now'))
ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
"#;

/// Table names in the schema.
pub mod tables {
    pub const TASKS: &str = "tasks";
    pub const SYSTEM_SETTINGS: &str = "system_settings";
}
