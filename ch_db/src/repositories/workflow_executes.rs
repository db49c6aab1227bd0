//! ABOUTME: WorkflowExecute repository - one row per live workflow run
//! ABOUTME: Holds the merged variable bag, step counters and the environment lock

use ch_core::{now_rfc3339, to_rfc3339, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use crate::map_write_err;

/// WorkflowExecute status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowExecuteStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl WorkflowExecuteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(Error::BadRequest(format!(
                "Unknown workflow execute status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkflowExecuteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WorkflowExecute entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecute {
    pub id: String,
    pub team_id: String,
    pub workflow_id: String,
    pub trigger_user: String,
    pub status: String,
    pub variables: String, // JSON object
    pub total_steps: i64,
    pub completed_steps: i64,
    pub success_steps: i64,
    pub failed_steps: i64,
    pub current_step: i64,
    pub locked_worker_id: Option<String>,
    pub locked_worker_name: Option<String>,
    pub locked_working_dir: Option<String>,
    pub error_message: Option<String>,
    pub failed_step_order: Option<i64>,
    pub timeout_at: Option<String>,
    pub finished_at: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkflowExecute {
    pub fn status(&self) -> Result<WorkflowExecuteStatus> {
        WorkflowExecuteStatus::parse(&self.status)
    }

    pub fn parse_variables(&self) -> Result<HashMap<String, serde_json::Value>> {
        if self.variables.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.variables)
            .map_err(|e| Error::BadRequest(format!("Invalid execute variables: {}", e)))
    }

    pub fn is_locked(&self) -> bool {
        self.locked_worker_id.is_some()
    }
}

/// Counter/variable update applied after each terminal step
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub variables: Option<HashMap<String, serde_json::Value>>,
    pub completed_steps: Option<i64>,
    pub success_steps: Option<i64>,
    pub failed_steps: Option<i64>,
    pub current_step: Option<i64>,
    pub status: Option<WorkflowExecuteStatus>,
    pub error_message: Option<String>,
    pub failed_step_order: Option<i64>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// WorkflowExecute repository
pub struct WorkflowExecuteRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkflowExecuteRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new execute in `pending`
    pub async fn create(
        &self,
        team_id: &str,
        workflow_id: &str,
        trigger_user: &str,
        variables: &HashMap<String, serde_json::Value>,
        total_steps: i64,
        timeout_at: Option<DateTime<Utc>>,
    ) -> Result<WorkflowExecute> {
        let id = Id::new().to_string();
        let now = now_rfc3339();
        let variables = serde_json::to_string(variables)
            .map_err(|e| Error::BadRequest(format!("Invalid execute variables: {}", e)))?;

        let we = sqlx::query_as::<_, WorkflowExecute>(
            r#"
            INSERT INTO workflow_executes (
                id, team_id, workflow_id, trigger_user, status, variables,
                total_steps, timeout_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(team_id)
        .bind(workflow_id)
        .bind(trigger_user)
        .bind(&variables)
        .bind(total_steps)
        .bind(timeout_at.map(to_rfc3339))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| map_write_err("workflow execute", e))?;

        debug!(execute_id = %we.id, workflow_id, "Workflow execute created");
        Ok(we)
    }

    /// Find execute by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<WorkflowExecute>> {
        sqlx::query_as::<_, WorkflowExecute>(
            "SELECT * FROM workflow_executes WHERE id = ? AND is_deleted = 0",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find workflow execute: {}", e)))
    }

    /// Tenant-checked fetch
    pub async fn get(&self, team_id: &str, id: &str) -> Result<WorkflowExecute> {
        let we = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow execute {} not found", id)))?;
        if we.team_id != team_id {
            return Err(Error::Forbidden(format!(
                "Workflow execute {} does not belong to team {}",
                id, team_id
            )));
        }
        Ok(we)
    }

    /// Persist variables and counters atomically. Terminal executes cannot be
    /// re-terminated with a different status; `current_step` never moves
    /// backwards.
    pub async fn apply_progress(&self, id: &str, update: ProgressUpdate) -> Result<WorkflowExecute> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let current = sqlx::query_as::<_, WorkflowExecute>(
            "SELECT * FROM workflow_executes WHERE id = ? AND is_deleted = 0",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to load workflow execute: {}", e)))?
        .ok_or_else(|| Error::NotFound(format!("Workflow execute {} not found", id)))?;

        let old_status = current.status()?;
        let new_status = update.status.unwrap_or(old_status);
        if old_status.is_terminal() && new_status != old_status {
            return Err(Error::Fatal(format!(
                "Workflow execute {} is terminal ({}) and cannot transition to {}",
                id, old_status, new_status
            )));
        }

        let variables = match &update.variables {
            Some(v) => serde_json::to_string(v)
                .map_err(|e| Error::BadRequest(format!("Invalid execute variables: {}", e)))?,
            None => current.variables.clone(),
        };
        let current_step = update
            .current_step
            .unwrap_or(current.current_step)
            .max(current.current_step);

        let now = now_rfc3339();
        sqlx::query(
            r#"
            UPDATE workflow_executes
            SET status = ?, variables = ?, completed_steps = ?, success_steps = ?,
                failed_steps = ?, current_step = ?, error_message = ?,
                failed_step_order = ?, finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(&variables)
        .bind(update.completed_steps.unwrap_or(current.completed_steps))
        .bind(update.success_steps.unwrap_or(current.success_steps))
        .bind(update.failed_steps.unwrap_or(current.failed_steps))
        .bind(current_step)
        .bind(update.error_message.as_ref().or(current.error_message.as_ref()))
        .bind(update.failed_step_order.or(current.failed_step_order))
        .bind(
            update
                .finished_at
                .map(to_rfc3339)
                .or(current.finished_at.clone()),
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to update workflow execute: {}", e)))?;

        let updated = sqlx::query_as::<_, WorkflowExecute>(
            "SELECT * FROM workflow_executes WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to reload workflow execute: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit progress: {}", e)))?;

        Ok(updated)
    }

    /// Record the environment lock once, after the first successful task.
    /// A second call is a no-op so the first lock always wins.
    pub async fn set_env_lock(
        &self,
        id: &str,
        worker_id: &str,
        worker_name: &str,
        working_dir: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executes
            SET locked_worker_id = ?, locked_worker_name = ?, locked_working_dir = ?,
                updated_at = ?
            WHERE id = ? AND locked_worker_id IS NULL
            "#,
        )
        .bind(worker_id)
        .bind(worker_name)
        .bind(working_dir)
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set environment lock: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Executes past their deadline that have not finished
    pub async fn running_expired(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowExecute>> {
        sqlx::query_as::<_, WorkflowExecute>(
            r#"
            SELECT * FROM workflow_executes
            WHERE status IN ('pending', 'running')
              AND timeout_at IS NOT NULL AND timeout_at <= ?
              AND is_deleted = 0
            "#,
        )
        .bind(to_rfc3339(now))
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load expired executes: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;
    use ch_core::utc_now;
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

    async fn create_execute(repo: &WorkflowExecuteRepository<'_>) -> WorkflowExecute {
        repo.create(
            "team-1",
            "wf-1",
            "operator",
            &HashMap::from([("env".to_string(), serde_json::json!("prod"))]),
            3,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_variables() {
        let db = create_test_db().await;
        let repo = WorkflowExecuteRepository::new(db.pool());

        let we = create_execute(&repo).await;
        assert_eq!(we.status, "pending");
        assert_eq!(we.total_steps, 3);
        assert_eq!(
            we.parse_variables().unwrap().get("env"),
            Some(&serde_json::json!("prod"))
        );
    }

    #[tokio::test]
    async fn test_progress_counters_and_monotone_current_step() {
        let db = create_test_db().await;
        let repo = WorkflowExecuteRepository::new(db.pool());
        let we = create_execute(&repo).await;

        let we = repo
            .apply_progress(
                &we.id,
                ProgressUpdate {
                    status: Some(WorkflowExecuteStatus::Running),
                    current_step: Some(2),
                    completed_steps: Some(1),
                    success_steps: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(we.current_step, 2);
        assert_eq!(we.completed_steps, we.success_steps + we.failed_steps);

        // current_step never moves backwards
        let we = repo
            .apply_progress(
                &we.id,
                ProgressUpdate {
                    current_step: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(we.current_step, 2);
    }

    #[tokio::test]
    async fn test_terminal_execute_is_final() {
        let db = create_test_db().await;
        let repo = WorkflowExecuteRepository::new(db.pool());
        let we = create_execute(&repo).await;

        repo.apply_progress(
            &we.id,
            ProgressUpdate {
                status: Some(WorkflowExecuteStatus::Failed),
                error_message: Some("step 2 failed".to_string()),
                failed_step_order: Some(2),
                finished_at: Some(utc_now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let regress = repo
            .apply_progress(
                &we.id,
                ProgressUpdate {
                    status: Some(WorkflowExecuteStatus::Success),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(regress, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn test_env_lock_first_writer_wins() {
        let db = create_test_db().await;
        let repo = WorkflowExecuteRepository::new(db.pool());
        let we = create_execute(&repo).await;

        assert!(repo
            .set_env_lock(&we.id, "w1", "worker-one", Some("/data/r1"))
            .await
            .unwrap());
        // Second writer loses
        assert!(!repo
            .set_env_lock(&we.id, "w2", "worker-two", Some("/data/r2"))
            .await
            .unwrap());

        let we = repo.find_by_id(&we.id).await.unwrap().unwrap();
        assert_eq!(we.locked_worker_name.as_deref(), Some("worker-one"));
        assert_eq!(we.locked_working_dir.as_deref(), Some("/data/r1"));
    }
}
