//! SQLite backlog store.
//!
//! Implements [`BacklogStore`] with sqlx. Every trait method catches its
//! own query error, logs it and returns the safe default.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

use super::backlog::{BacklogStore, BacklogTask, TaskStatus};
use super::schema;

/// Errors that can occur while opening or seeding the backlog database.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),
}

/// Backlog store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteBacklog {
    pool: SqlitePool,
}

impl SqliteBacklog {
    /// Opens (creating if missing) the database file and ensures the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL or path (e.g., "sqlite://data/backlog.db")
    pub async fn connect(database_url: &str) -> Result<Self, BacklogError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| BacklogError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| BacklogError::ConnectionFailed(e.to_string()))?;

        let backlog = Self { pool };
        backlog.ensure_schema().await?;

        info!(url = %url, "Backlog database opened");
        Ok(backlog)
    }

    /// Creates a store from an existing pool without touching the schema.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the backlog tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), BacklogError> {
        for statement in schema::all_schema_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Appends a task to the backlog and returns its id.
    pub async fn insert_task(
        &self,
        prompt: &str,
        order: i64,
        status: TaskStatus,
    ) -> Result<i64, BacklogError> {
        let result = sqlx::query(schema::INSERT_TASK)
            .bind(None::<String>)
            .bind(order)
            .bind(prompt)
            .bind(status.code())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl BacklogStore for SqliteBacklog {
    async fn is_setting_enabled(&self, name: &str) -> bool {
        match sqlx::query(schema::SELECT_SETTING)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.map(|r| r.get::<i64, _>("value") != 0).unwrap_or(false),
            Err(e) => {
                warn!(setting = %name, error = %e, "Failed to read setting");
                false
            }
        }
    }

    async fn set_setting(&self, name: &str, enabled: bool) -> bool {
        match sqlx::query(schema::UPSERT_SETTING)
            .bind(name)
            .bind(i64::from(enabled))
            .execute(&self.pool)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(setting = %name, error = %e, "Failed to write setting");
                false
            }
        }
    }

    async fn next_ready_task(&self) -> Option<BacklogTask> {
        let row = match sqlx::query(schema::SELECT_NEXT_READY_TASK)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row?,
            Err(e) => {
                warn!(error = %e, "Failed to read next backlog task");
                return None;
            }
        };

        Some(BacklogTask {
            id: row.get("id"),
            uuid: row.get("uuid"),
            order: row.get("order"),
            prompt: row.get("prompt"),
            status: TaskStatus::from_code(row.get("status")),
        })
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> bool {
        match sqlx::query(schema::UPDATE_TASK_STATUS)
            .bind(status.code())
            .bind(id)
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() > 0,
            Err(e) => {
                warn!(task_id = id, status = %status, error = %e, "Failed to update task status");
                false
            }
        }
    }

    async fn task_status(&self, id: i64) -> Option<TaskStatus> {
        match sqlx::query(schema::SELECT_TASK_STATUS)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row.map(|r| TaskStatus::from_code(r.get("status"))),
            Err(e) => {
                warn!(task_id = id, error = %e, "Failed to read task status");
                None
            }
        }
    }
}
