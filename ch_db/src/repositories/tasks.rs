//! ABOUTME: Task repository - one row per execution instance
//! ABOUTME: Owns status transitions, the cronjob mirror, and the retry cascade

use ch_core::{now_rfc3339, to_rfc3339, utc_now, Error, Id, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::map_write_err;

/// Task lifecycle status
///
/// `Todo` is an internal pre-pending state for workflow steps that have not
/// been activated yet; it never reaches a worker and is excluded from every
/// scheduler sweep. `Retrying` marks an origin task whose retry clone is in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Pending,
    Running,
    Success,
    Failed,
    Error,
    Timeout,
    Canceled,
    Stopped,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Stopped => "stopped",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(Self::Todo),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "canceled" => Ok(Self::Canceled),
            "stopped" => Ok(Self::Stopped),
            "retrying" => Ok(Self::Retrying),
            other => Err(Error::BadRequest(format!("Unknown task status: {}", other))),
        }
    }

    /// Terminal statuses are final, with one carve-out: a failed/error task
    /// may move to `retrying` when its retry clone is scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Error | Self::Timeout | Self::Canceled | Self::Stopped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rich task metadata: a flat struct plus an open-ended extension bag
///
/// Inherited from the owning CronJob or Workflow step and overridden at
/// runtime (retry clones, environment lock).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMeta {
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub worker_select: Vec<String>,
    pub worker_labels: HashMap<String, String>,
    pub priority: i64,
    pub resources: HashMap<String, String>,
    /// Origin task id on retry clones
    pub parent_task: Option<String>,
    /// Set when a conditional workflow step was skipped
    pub skipped: bool,
    #[serde(flatten)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl TaskMeta {
    /// Apply overrides on top of this metadata. Unset override fields leave
    /// the base untouched, so merging an empty override is the identity; maps
    /// merge key-wise with the override winning.
    pub fn merged(&self, overrides: &TaskMeta) -> TaskMeta {
        let mut out = self.clone();
        if overrides.working_dir.is_some() {
            out.working_dir = overrides.working_dir.clone();
        }
        for (k, v) in &overrides.env {
            out.env.insert(k.clone(), v.clone());
        }
        if !overrides.worker_select.is_empty() {
            out.worker_select = overrides.worker_select.clone();
        }
        for (k, v) in &overrides.worker_labels {
            out.worker_labels.insert(k.clone(), v.clone());
        }
        if overrides.priority != 0 {
            out.priority = overrides.priority;
        }
        for (k, v) in &overrides.resources {
            out.resources.insert(k.clone(), v.clone());
        }
        if overrides.parent_task.is_some() {
            out.parent_task = overrides.parent_task.clone();
        }
        if overrides.skipped {
            out.skipped = true;
        }
        for (k, v) in &overrides.extensions {
            out.extensions.insert(k.clone(), v.clone());
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::BadRequest(format!("Invalid task metadata: {}", e)))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(s)
            .map_err(|e| Error::BadRequest(format!("Invalid task metadata: {}", e)))
    }
}

/// Task entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub team_id: String,
    pub cronjob_id: Option<String>,
    pub workflow_exec_id: Option<String>,
    pub step_order: Option<i64>,
    pub prev_id: Option<String>,
    pub next_id: Option<String>,
    pub is_group: bool,
    pub category: String,
    pub command: String,
    pub args: String, // JSON
    pub description: String,
    pub meta: String, // JSON TaskMeta
    pub status: String,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub save_log: bool,
    pub time_plan: String,
    pub timeout_at: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub retry_count: i64,
    pub max_retry: i64,
    pub retryable: bool,
    pub is_retry: bool,
    pub next_retry_time: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn status(&self) -> Result<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn parse_meta(&self) -> Result<TaskMeta> {
        TaskMeta::from_json(&self.meta)
    }
}

/// Request to create a new task
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub team_id: String,
    pub cronjob_id: Option<String>,
    pub workflow_exec_id: Option<String>,
    pub step_order: Option<i64>,
    pub category: String,
    pub command: String,
    pub args: String, // JSON
    pub description: String,
    pub meta: TaskMeta,
    pub status: TaskStatus,
    pub save_log: bool,
    pub time_plan: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub max_retry: i64,
    pub retryable: bool,
    pub is_retry: bool,
    pub retry_count: i64,
}

/// Partial update applied by `TaskRepository::patch`
///
/// Every `Some` is written, including `Some(false)` and `Some(0)`; nested
/// options clear nullable columns.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub args: Option<String>,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub timeout_at: Option<Option<DateTime<Utc>>>,
    pub retry_count: Option<i64>,
    pub retryable: Option<bool>,
    pub next_retry_time: Option<Option<DateTime<Utc>>>,
    pub meta: Option<TaskMeta>,
}

/// Exponential backoff parameters for retry scheduling
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub base_secs: i64,
    pub multiplier: f64,
    pub max_secs: i64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_secs: 60,
            multiplier: 2.0,
            max_secs: 3600,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry attempt `n` (0-based over completed attempts):
    /// `min(base * multiplier^n, max)`.
    pub fn delay_secs(&self, attempt: i64) -> i64 {
        let raw = self.base_secs as f64 * self.multiplier.powi(attempt.max(0) as i32);
        (raw as i64).min(self.max_secs)
    }

    /// Absolute next-retry instant after a failure at `failure_time`
    pub fn next_retry_time(&self, attempt: i64, failure_time: DateTime<Utc>) -> DateTime<Utc> {
        failure_time + Duration::seconds(self.delay_secs(attempt))
    }
}

/// Task repository
pub struct TaskRepository<'a> {
    pool: &'a SqlitePool,
    backoff: RetryBackoff,
}

impl<'a> TaskRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self {
            pool,
            backoff: RetryBackoff::default(),
        }
    }

    pub fn with_backoff(pool: &'a SqlitePool, backoff: RetryBackoff) -> Self {
        Self { pool, backoff }
    }

    /// Create a new task
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Task> {
        let id = Id::new().to_string();
        let now = now_rfc3339();
        let meta = request.meta.to_json()?;

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (
                id, team_id, cronjob_id, workflow_exec_id, step_order,
                is_group, category, command, args, description, meta,
                status, save_log, time_plan, timeout_at,
                retry_count, max_retry, retryable, is_retry,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.team_id)
        .bind(&request.cronjob_id)
        .bind(&request.workflow_exec_id)
        .bind(request.step_order)
        .bind(&request.category)
        .bind(&request.command)
        .bind(&request.args)
        .bind(&request.description)
        .bind(&meta)
        .bind(request.status.as_str())
        .bind(request.save_log)
        .bind(to_rfc3339(request.time_plan))
        .bind(request.timeout_at.map(to_rfc3339))
        .bind(request.retry_count)
        .bind(request.max_retry)
        .bind(request.retryable)
        .bind(request.is_retry)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| map_write_err("task", e))?;

        debug!(task_id = %task.id, status = %task.status, "Task created");
        Ok(task)
    }

    /// Insert a set of tasks in one transaction (workflow step rows)
    pub async fn create_many(&self, requests: Vec<CreateTaskRequest>) -> Result<Vec<Task>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            let id = Id::new().to_string();
            let now = now_rfc3339();
            let meta = request.meta.to_json()?;

            let task = sqlx::query_as::<_, Task>(
                r#"
                INSERT INTO tasks (
                    id, team_id, cronjob_id, workflow_exec_id, step_order,
                    is_group, category, command, args, description, meta,
                    status, save_log, time_plan, timeout_at,
                    retry_count, max_retry, retryable, is_retry,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(&id)
            .bind(&request.team_id)
            .bind(&request.cronjob_id)
            .bind(&request.workflow_exec_id)
            .bind(request.step_order)
            .bind(&request.category)
            .bind(&request.command)
            .bind(&request.args)
            .bind(&request.description)
            .bind(&meta)
            .bind(request.status.as_str())
            .bind(request.save_log)
            .bind(to_rfc3339(request.time_plan))
            .bind(request.timeout_at.map(to_rfc3339))
            .bind(request.retry_count)
            .bind(request.max_retry)
            .bind(request.retryable)
            .bind(request.is_retry)
            .bind(&now)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_write_err("task", e))?;
            created.push(task);
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit task batch: {}", e)))?;

        Ok(created)
    }

    /// Find task by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find task: {}", e)))
    }

    /// Tenant-checked fetch for the operator surface
    pub async fn get(&self, team_id: &str, id: &str) -> Result<Task> {
        let task = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))?;
        if task.team_id != team_id {
            return Err(Error::Forbidden(format!(
                "Task {} does not belong to team {}",
                id, team_id
            )));
        }
        Ok(task)
    }

    /// Tenant listing ordered by creation, newest first
    pub async fn list_for_team(
        &self,
        team_id: &str,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        match status {
            Some(s) => sqlx::query_as::<_, Task>(
                r#"
                SELECT * FROM tasks
                WHERE team_id = ? AND status = ? AND is_deleted = 0
                ORDER BY created_at DESC LIMIT ?
                "#,
            )
            .bind(team_id)
            .bind(s.as_str())
            .bind(limit)
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list tasks: {}", e))),
            None => sqlx::query_as::<_, Task>(
                r#"
                SELECT * FROM tasks
                WHERE team_id = ? AND is_deleted = 0
                ORDER BY created_at DESC LIMIT ?
                "#,
            )
            .bind(team_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list tasks: {}", e))),
        }
    }

    /// Tasks of one workflow execute, ordered by step
    pub async fn list_by_workflow_exec(&self, workflow_exec_id: &str) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE workflow_exec_id = ? AND is_deleted = 0
            ORDER BY step_order ASC, created_at ASC
            "#,
        )
        .bind(workflow_exec_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list workflow tasks: {}", e)))
    }

    /// Unclaimed or claimed tasks whose deadline has passed (timeout sweep)
    pub async fn pending_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('pending', 'running')
              AND timeout_at IS NOT NULL AND timeout_at <= ?
              AND is_deleted = 0
            "#,
        )
        .bind(to_rfc3339(now))
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load expired tasks: {}", e)))
    }

    /// Failed origin tasks that are due for a retry clone (retry sweep)
    pub async fn need_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Task>> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE status IN ('failed', 'error')
              AND retryable = 1 AND is_retry = 0
              AND next_retry_time IS NOT NULL AND next_retry_time <= ?
              AND retry_count < max_retry
              AND is_deleted = 0
            ORDER BY next_retry_time ASC LIMIT ?
            "#,
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load retry candidates: {}", e)))
    }

    /// First-wins claim: `pending -> running` compare-and-set. Returns the
    /// claimed task, or `Conflict` if another worker already claimed it.
    pub async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let now_s = to_rfc3339(now);
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running', worker_id = ?, worker_name = ?,
                time_start = ?, updated_at = ?
            WHERE id = ? AND status = 'pending' AND is_deleted = 0
            "#,
        )
        .bind(worker_id)
        .bind(worker_name)
        .bind(&now_s)
        .bind(&now_s)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to claim task: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "Task {} already claimed or no longer pending",
                id
            )));
        }

        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found after claim", id)))
    }

    /// Partial update with terminal-state enforcement, cronjob mirroring and
    /// the retry cascade, all inside one transaction.
    pub async fn patch(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let current = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to load task: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))?;

        let old_status = current.status()?;
        let new_status = patch.status.unwrap_or(old_status);

        if old_status.is_terminal() && new_status != old_status {
            // Retry scheduling is the only legal exit from a terminal state
            let retry_exit = matches!(old_status, TaskStatus::Failed | TaskStatus::Error)
                && new_status == TaskStatus::Retrying;
            if !retry_exit {
                return Err(Error::Fatal(format!(
                    "Task {} is terminal ({}) and cannot transition to {}",
                    id, old_status, new_status
                )));
            }
        }

        let now = now_rfc3339();
        let args = patch.args.unwrap_or(current.args.clone());
        let output = patch.output.or(current.output.clone());
        let failure_reason = patch.failure_reason.or(current.failure_reason.clone());
        let worker_id = patch.worker_id.or(current.worker_id.clone());
        let worker_name = patch.worker_name.or(current.worker_name.clone());
        let time_start = patch
            .time_start
            .map(to_rfc3339)
            .or(current.time_start.clone());
        let time_end = patch.time_end.map(to_rfc3339).or(current.time_end.clone());
        let timeout_at = match patch.timeout_at {
            Some(v) => v.map(to_rfc3339),
            None => current.timeout_at.clone(),
        };
        let retry_count = patch.retry_count.unwrap_or(current.retry_count);
        let retryable = patch.retryable.unwrap_or(current.retryable);
        let next_retry_time = match patch.next_retry_time {
            Some(v) => v.map(to_rfc3339),
            None => current.next_retry_time.clone(),
        };
        let meta = match &patch.meta {
            Some(m) => m.to_json()?,
            None => current.meta.clone(),
        };

        if retry_count > current.max_retry {
            return Err(Error::Fatal(format!(
                "Task {} retry_count {} would exceed max_retry {}",
                id, retry_count, current.max_retry
            )));
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, args = ?, output = ?, failure_reason = ?, worker_id = ?,
                worker_name = ?, time_start = ?, time_end = ?, timeout_at = ?,
                retry_count = ?, retryable = ?, next_retry_time = ?, meta = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(&args)
        .bind(&output)
        .bind(&failure_reason)
        .bind(&worker_id)
        .bind(&worker_name)
        .bind(&time_start)
        .bind(&time_end)
        .bind(&timeout_at)
        .bind(retry_count)
        .bind(retryable)
        .bind(&next_retry_time)
        .bind(&meta)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to patch task: {}", e)))?;

        let entered_terminal = new_status.is_terminal() && new_status != old_status;

        // Mirror the terminal outcome onto the owning cronjob
        if entered_terminal {
            if let Some(cronjob_id) = &current.cronjob_id {
                sqlx::query(
                    r#"
                    UPDATE cronjobs
                    SET last_status = ?, last_dispatch = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(new_status.as_str())
                .bind(&now)
                .bind(&now)
                .bind(cronjob_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("Failed to mirror cronjob status: {}", e)))?;
            }
        }

        // Retry cascade: a finished retry clone settles its origin task
        if entered_terminal && current.is_retry {
            let parent = current.parse_meta()?.parent_task;
            if let Some(parent_id) = parent {
                match new_status {
                    TaskStatus::Success => {
                        sqlx::query(
                            "UPDATE tasks SET retryable = 0, updated_at = ? WHERE id = ?",
                        )
                        .bind(&now)
                        .bind(&parent_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            Error::Database(format!("Failed to settle retry origin: {}", e))
                        })?;
                    }
                    TaskStatus::Failed | TaskStatus::Error => {
                        if current.retry_count < current.max_retry {
                            let next =
                                self.backoff.next_retry_time(current.retry_count, utc_now());
                            sqlx::query(
                                r#"
                                UPDATE tasks
                                SET status = 'failed', next_retry_time = ?, updated_at = ?
                                WHERE id = ?
                                "#,
                            )
                            .bind(to_rfc3339(next))
                            .bind(&now)
                            .bind(&parent_id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| {
                                Error::Database(format!("Failed to reschedule origin: {}", e))
                            })?;
                        } else {
                            sqlx::query(
                                r#"
                                UPDATE tasks
                                SET retryable = 0, next_retry_time = NULL, updated_at = ?
                                WHERE id = ?
                                "#,
                            )
                            .bind(&now)
                            .bind(&parent_id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| {
                                Error::Database(format!("Failed to exhaust origin retries: {}", e))
                            })?;
                            warn!(
                                origin = %parent_id,
                                retry_task = %id,
                                "Retry budget exhausted"
                            );
                        }
                    }
                    _ => {}
                }
            }
        }

        let updated = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to reload task: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit task patch: {}", e)))?;

        Ok(updated)
    }

    /// Clone a failed origin into a fresh pending retry task and park the
    /// origin in `retrying`, both in one transaction.
    pub async fn spawn_retry(
        &self,
        origin: &Task,
        now: DateTime<Utc>,
        timeout_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let attempt = origin.retry_count + 1;
        if attempt > origin.max_retry {
            return Err(Error::BadRequest(format!(
                "Task {} has no retry budget left",
                origin.id
            )));
        }

        let mut meta = origin.parse_meta()?;
        meta.parent_task = Some(origin.id.clone());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let id = Id::new().to_string();
        let now_s = to_rfc3339(now);
        let clone = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (
                id, team_id, cronjob_id, workflow_exec_id, step_order,
                is_group, category, command, args, description, meta,
                status, save_log, time_plan, timeout_at,
                retry_count, max_retry, retryable, is_retry,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&origin.team_id)
        .bind(&origin.cronjob_id)
        .bind(&origin.workflow_exec_id)
        .bind(origin.step_order)
        .bind(&origin.category)
        .bind(&origin.command)
        .bind(&origin.args)
        .bind(&origin.description)
        .bind(meta.to_json()?)
        .bind(origin.save_log)
        .bind(&now_s)
        .bind(timeout_at.map(to_rfc3339))
        .bind(attempt)
        .bind(origin.max_retry)
        .bind(origin.retryable)
        .bind(&now_s)
        .bind(&now_s)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_err("retry task", e))?;

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'retrying', retry_count = ?, next_retry_time = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt)
        .bind(&now_s)
        .bind(&origin.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to park retry origin: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit retry spawn: {}", e)))?;

        debug!(origin = %origin.id, retry_task = %clone.id, attempt, "Retry task spawned");
        Ok(clone)
    }
}
