//! ABOUTME: TaskLog repository - append-only per-task output sink
//! ABOUTME: Chunks arrive from task_update events when save_log is enabled

use ch_core::{now_rfc3339, Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One appended log chunk
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLogEntry {
    pub id: String,
    pub task_id: String,
    pub seq: i64,
    pub content: String,
    pub created_at: String,
}

/// TaskLog repository
pub struct TaskLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TaskLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a chunk with the next sequence number
    pub async fn append(&self, task_id: &str, content: &str) -> Result<TaskLogEntry> {
        let id = Id::new().to_string();
        let now = now_rfc3339();

        sqlx::query_as::<_, TaskLogEntry>(
            r#"
            INSERT INTO task_logs (id, task_id, seq, content, created_at)
            VALUES (
                ?, ?,
                COALESCE((SELECT MAX(seq) + 1 FROM task_logs WHERE task_id = ?), 0),
                ?, ?
            )
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(task_id)
        .bind(task_id)
        .bind(content)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to append task log: {}", e)))
    }

    /// Full log for a task in append order
    pub async fn fetch(&self, task_id: &str) -> Result<Vec<TaskLogEntry>> {
        sqlx::query_as::<_, TaskLogEntry>(
            "SELECT * FROM task_logs WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch task log: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn create_test_db() -> Db {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("Failed to open in-memory db");
        let db = Db::attach(pool);
        db.migrate().await.expect("Failed to migrate");
        db
    }

    #[tokio::test]
    async fn test_append_keeps_order() {
        let db = create_test_db().await;
        let repo = TaskLogRepository::new(db.pool());

        repo.append("task-1", "line one").await.unwrap();
        repo.append("task-1", "line two").await.unwrap();
        repo.append("task-2", "other task").await.unwrap();

        let log = repo.fetch("task-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);
        assert_eq!(log[0].content, "line one");
        assert_eq!(log[1].content, "line two");
    }
}
