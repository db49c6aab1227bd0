//! ABOUTME: CronJob repository - recurring job templates
//! ABOUTME: Provides due-scan, schedule advancement, and deactivation paths

use ch_core::{now_rfc3339, to_rfc3339, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

use crate::map_write_err;
use crate::repositories::tasks::TaskMeta;

/// CronJob entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CronJob {
    pub id: String,
    pub team_id: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub expression: String,
    pub command: String,
    pub args: String, // JSON
    pub meta: String, // JSON TaskMeta
    pub description: String,
    pub timeout_secs: i64,
    pub save_log: bool,
    pub is_active: bool,
    pub disable_reason: Option<String>,
    pub max_retry: i64,
    pub retryable: bool,
    pub last_plan: Option<String>,
    pub last_dispatch: Option<String>,
    pub last_status: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl CronJob {
    pub fn parse_meta(&self) -> Result<TaskMeta> {
        TaskMeta::from_json(&self.meta)
    }
}

/// Request to create a new cronjob
#[derive(Debug, Clone)]
pub struct CreateCronJobRequest {
    pub team_id: String,
    pub project: String,
    pub category: String,
    pub name: String,
    pub expression: String,
    pub command: String,
    pub args: String, // JSON
    pub meta: TaskMeta,
    pub description: String,
    pub timeout_secs: i64,
    pub save_log: bool,
    pub is_active: bool,
    pub max_retry: i64,
    pub retryable: bool,
}

/// Partial update for operator edits
#[derive(Debug, Clone, Default)]
pub struct UpdateCronJobRequest {
    pub expression: Option<String>,
    pub command: Option<String>,
    pub args: Option<String>,
    pub meta: Option<TaskMeta>,
    pub description: Option<String>,
    pub timeout_secs: Option<i64>,
    pub save_log: Option<bool>,
    pub is_active: Option<bool>,
    pub max_retry: Option<i64>,
    pub retryable: Option<bool>,
}

/// CronJob repository
pub struct CronJobRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CronJobRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new cronjob
    pub async fn create(&self, request: CreateCronJobRequest) -> Result<CronJob> {
        let id = Id::new().to_string();
        let now = now_rfc3339();
        let meta = request.meta.to_json()?;

        let job = sqlx::query_as::<_, CronJob>(
            r#"
            INSERT INTO cronjobs (
                id, team_id, project, category, name, expression, command,
                args, meta, description, timeout_secs, save_log, is_active,
                max_retry, retryable, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.team_id)
        .bind(&request.project)
        .bind(&request.category)
        .bind(&request.name)
        .bind(&request.expression)
        .bind(&request.command)
        .bind(&request.args)
        .bind(&meta)
        .bind(&request.description)
        .bind(request.timeout_secs)
        .bind(request.save_log)
        .bind(request.is_active)
        .bind(request.max_retry)
        .bind(request.retryable)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| map_write_err("cronjob", e))?;

        info!(cronjob_id = %job.id, name = %job.name, "CronJob created");
        Ok(job)
    }

    /// Find cronjob by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<CronJob>> {
        sqlx::query_as::<_, CronJob>("SELECT * FROM cronjobs WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find cronjob: {}", e)))
    }

    /// Tenant-checked fetch
    pub async fn get(&self, team_id: &str, id: &str) -> Result<CronJob> {
        let job = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("CronJob {} not found", id)))?;
        if job.team_id != team_id {
            return Err(Error::Forbidden(format!(
                "CronJob {} does not belong to team {}",
                id, team_id
            )));
        }
        Ok(job)
    }

    /// Apply operator edits
    pub async fn update(&self, team_id: &str, id: &str, request: UpdateCronJobRequest) -> Result<CronJob> {
        let current = self.get(team_id, id).await?;
        let now = now_rfc3339();

        let meta = match &request.meta {
            Some(m) => m.to_json()?,
            None => current.meta.clone(),
        };

        sqlx::query(
            r#"
            UPDATE cronjobs
            SET expression = ?, command = ?, args = ?, meta = ?, description = ?,
                timeout_secs = ?, save_log = ?, is_active = ?, max_retry = ?,
                retryable = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(request.expression.unwrap_or(current.expression))
        .bind(request.command.unwrap_or(current.command))
        .bind(request.args.unwrap_or(current.args))
        .bind(&meta)
        .bind(request.description.unwrap_or(current.description))
        .bind(request.timeout_secs.unwrap_or(current.timeout_secs))
        .bind(request.save_log.unwrap_or(current.save_log))
        .bind(request.is_active.unwrap_or(current.is_active))
        .bind(request.max_retry.unwrap_or(current.max_retry))
        .bind(request.retryable.unwrap_or(current.retryable))
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| map_write_err("cronjob", e))?;

        self.get(team_id, id).await
    }

    /// Soft delete
    pub async fn delete(&self, team_id: &str, id: &str) -> Result<()> {
        self.get(team_id, id).await?;
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE cronjobs SET is_deleted = 1, deleted_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to delete cronjob: {}", e)))?;
        Ok(())
    }

    /// Active cronjobs whose schedule has come due
    pub async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<CronJob>> {
        sqlx::query_as::<_, CronJob>(
            r#"
            SELECT * FROM cronjobs
            WHERE is_active = 1 AND is_deleted = 0
              AND last_plan IS NOT NULL AND last_plan <= ?
            ORDER BY last_plan ASC LIMIT ?
            "#,
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load due cronjobs: {}", e)))
    }

    /// Seed `last_plan` for active rows that never had one, so freshly
    /// created jobs enter the due-scan on the next tick.
    pub async fn batch_initialise_last_plan(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cronjobs
            SET last_plan = ?, updated_at = ?
            WHERE last_plan IS NULL AND is_active = 1 AND is_deleted = 0
            "#,
        )
        .bind(to_rfc3339(now))
        .bind(now_rfc3339())
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to initialise last_plan: {}", e)))?;

        let n = result.rows_affected();
        if n > 0 {
            debug!(count = n, "Initialised last_plan for new cronjobs");
        }
        Ok(n)
    }

    /// Advance the schedule after a fire
    pub async fn set_last_plan(&self, id: &str, next: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE cronjobs SET last_plan = ?, updated_at = ? WHERE id = ?")
            .bind(to_rfc3339(next))
            .bind(now_rfc3339())
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to advance last_plan: {}", e)))?;
        Ok(())
    }

    /// Deactivate a job whose schedule can no longer fire
    pub async fn deactivate(&self, id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cronjobs SET is_active = 0, disable_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to deactivate cronjob: {}", e)))?;
        info!(cronjob_id = %id, reason = %reason, "CronJob deactivated");
        Ok(())
    }

    /// Tenant listing
    pub async fn list_for_team(&self, team_id: &str, limit: i64) -> Result<Vec<CronJob>> {
        sqlx::query_as::<_, CronJob>(
            r#"
            SELECT * FROM cronjobs
            WHERE team_id = ? AND is_deleted = 0
            ORDER BY created_at DESC LIMIT ?
            "#,
        )
        .bind(team_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list cronjobs: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::tasks::{
        CreateTaskRequest, TaskPatch, TaskRepository, TaskStatus,
    };
    use crate::Db;
    use ch_core::utc_now;
    use chrono::Duration;
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

    fn basic_request(name: &str) -> CreateCronJobRequest {
        CreateCronJobRequest {
            team_id: "team-1".to_string(),
            project: "infra".to_string(),
            category: "default".to_string(),
            name: name.to_string(),
            expression: "0 */5 * * * * *".to_string(),
            command: "backup.sh".to_string(),
            args: "{}".to_string(),
            meta: TaskMeta::default(),
            description: String::new(),
            timeout_secs: 300,
            save_log: true,
            is_active: true,
            max_retry: 2,
            retryable: true,
        }
    }

    #[tokio::test]
    async fn test_create_find_update() {
        let db = create_test_db().await;
        let repo = CronJobRepository::new(db.pool());

        let job = repo.create(basic_request("nightly-backup")).await.unwrap();
        assert!(job.is_active);
        assert!(job.last_plan.is_none());

        let fetched = repo.get("team-1", &job.id).await.unwrap();
        assert_eq!(fetched.name, "nightly-backup");

        let updated = repo
            .update(
                "team-1",
                &job.id,
                UpdateCronJobRequest {
                    command: Some("backup.sh --full".to_string()),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.command, "backup.sh --full");
        assert!(!updated.is_active);

        assert_eq!(repo.list_for_team("team-1", 10).await.unwrap().len(), 1);
        assert!(repo.list_for_team("team-2", 10).await.unwrap().is_empty());

        repo.delete("team-1", &job.id).await.unwrap();
        assert!(repo.find_by_id(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let db = create_test_db().await;
        let repo = CronJobRepository::new(db.pool());

        repo.create(basic_request("dup")).await.unwrap();
        let second = repo.create(basic_request("dup")).await;
        assert!(matches!(second, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_due_scan_and_initialise() {
        let db = create_test_db().await;
        let repo = CronJobRepository::new(db.pool());
        let now = utc_now();

        let job = repo.create(basic_request("due-job")).await.unwrap();
        // Without a last_plan the job is invisible to the due scan
        assert!(repo.due(now, 10).await.unwrap().is_empty());

        let seeded = repo.batch_initialise_last_plan(now).await.unwrap();
        assert_eq!(seeded, 1);

        let due = repo.due(now + Duration::seconds(1), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, job.id);

        // Advancing the plan removes it from the scan window
        repo.set_last_plan(&job.id, now + Duration::seconds(300))
            .await
            .unwrap();
        assert!(repo.due(now + Duration::seconds(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_records_reason() {
        let db = create_test_db().await;
        let repo = CronJobRepository::new(db.pool());

        let job = repo.create(basic_request("dead-schedule")).await.unwrap();
        repo.deactivate(&job.id, "schedule unreachable").await.unwrap();

        let job = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert!(!job.is_active);
        assert_eq!(job.disable_reason.as_deref(), Some("schedule unreachable"));
    }

    #[tokio::test]
    async fn test_terminal_task_mirrors_onto_cronjob() {
        let db = create_test_db().await;
        let cronjobs = CronJobRepository::new(db.pool());
        let tasks = TaskRepository::new(db.pool());

        let job = cronjobs.create(basic_request("mirrored")).await.unwrap();
        let task = tasks
            .create(CreateTaskRequest {
                team_id: "team-1".to_string(),
                cronjob_id: Some(job.id.clone()),
                workflow_exec_id: None,
                step_order: None,
                category: "default".to_string(),
                command: job.command.clone(),
                args: "{}".to_string(),
                description: String::new(),
                meta: TaskMeta::default(),
                status: TaskStatus::Pending,
                save_log: false,
                time_plan: utc_now(),
                timeout_at: None,
                max_retry: 0,
                retryable: false,
                is_retry: false,
                retry_count: 0,
            })
            .await
            .unwrap();

        tasks
            .patch(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Success),
                    time_end: Some(utc_now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mirrored = cronjobs.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(mirrored.last_status.as_deref(), Some("success"));
        assert!(mirrored.last_dispatch.is_some());
    }
}
