//! ABOUTME: Ingestion path for task_update client events
//! ABOUTME: First-wins claims, terminal transitions, retry scheduling, log sink

use async_trait::async_trait;
use ch_core::{parse_rfc3339, utc_now, Error, Result};
use ch_db::{TaskLogRepository, TaskPatch, TaskStatus, WorkerRepository};
use ch_hub::{TaskUpdateData, TaskUpdateSink};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::Dispatcher;

/// Applies worker status reports to the store
pub struct TaskUpdates {
    dispatcher: Arc<Dispatcher>,
}

impl TaskUpdates {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn worker_name(&self, worker_id: &str, provided: Option<String>) -> Result<String> {
        if let Some(name) = provided {
            return Ok(name);
        }
        let worker = WorkerRepository::new(self.dispatcher.db().pool())
            .find_by_id(worker_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Worker {} not registered", worker_id)))?;
        Ok(worker.name)
    }

    async fn apply_claim(
        &self,
        worker_id: &str,
        task_id: &str,
        update: TaskUpdateData,
    ) -> Result<()> {
        let d = &self.dispatcher;
        let task = d
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;

        // A repeated claim from the winning worker is idempotent
        if task.status()? == TaskStatus::Running {
            if task.worker_id.as_deref() == Some(worker_id) {
                return Ok(());
            }
            return Err(Error::Conflict(format!(
                "Task {} already claimed by another worker",
                task_id
            )));
        }

        let worker_name = self.worker_name(worker_id, update.worker_name).await?;
        let claimed = d
            .tasks()
            .claim(task_id, worker_id, &worker_name, utc_now())
            .await?;
        debug!(task_id = %claimed.id, worker = %worker_name, "Task claimed");
        Ok(())
    }

    async fn apply_terminal(
        &self,
        status: TaskStatus,
        worker_id: &str,
        task_id: &str,
        update: TaskUpdateData,
    ) -> Result<()> {
        let d = &self.dispatcher;
        let task = d
            .tasks()
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task_id)))?;

        let time_end = match &update.time_end {
            Some(t) => parse_rfc3339(t)?,
            None => utc_now(),
        };
        let time_start = update.time_start.as_deref().map(parse_rfc3339).transpose()?;

        // Failure classification: trust the worker's reason, otherwise
        // pattern-match the output.
        let failure_reason = match status {
            TaskStatus::Failed | TaskStatus::Error => Some(update.failure_reason.unwrap_or_else(
                || RetryPolicy::classify(update.output.as_deref().unwrap_or_default()).to_string(),
            )),
            _ => update.failure_reason,
        };

        // Schedule the first retry window on an origin failure
        let next_retry_time = if matches!(status, TaskStatus::Failed | TaskStatus::Error)
            && !task.is_retry
            && task.retryable
            && task.retry_count < task.max_retry
        {
            Some(Some(d.policy().next_retry_time(task.retry_count, time_end)))
        } else {
            None
        };

        let patched = d
            .tasks()
            .patch(
                task_id,
                TaskPatch {
                    status: Some(status),
                    output: update.output.clone(),
                    failure_reason,
                    worker_id: Some(worker_id.to_string()),
                    worker_name: update.worker_name.clone(),
                    time_start,
                    time_end: Some(time_end),
                    next_retry_time,
                    ..Default::default()
                },
            )
            .await?;

        if patched.save_log {
            if let Some(output) = &update.output {
                if let Err(e) = TaskLogRepository::new(d.db().pool())
                    .append(task_id, output)
                    .await
                {
                    warn!(task_id, error = %e, "Failed to append task log");
                }
            }
        }

        d.metrics().inc_completed(patched.status.as_str());
        debug!(task_id = %patched.id, status = %patched.status, "Task reached terminal status");
        d.notify_terminal(&patched).await;
        Ok(())
    }
}

#[async_trait]
impl TaskUpdateSink for TaskUpdates {
    async fn apply(&self, worker_id: &str, task_id: &str, update: TaskUpdateData) -> Result<()> {
        let status = match &update.status {
            Some(s) => TaskStatus::parse(s)?,
            None => {
                // Pure output append (streaming logs mid-run)
                if let Some(output) = &update.output {
                    TaskLogRepository::new(self.dispatcher.db().pool())
                        .append(task_id, output)
                        .await?;
                }
                return Ok(());
            }
        };

        match status {
            TaskStatus::Running => self.apply_claim(worker_id, task_id, update).await,
            s if s.is_terminal() => self.apply_terminal(s, worker_id, task_id, update).await,
            other => Err(Error::BadRequest(format!(
                "Workers may not report status {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DispatcherConfig, RetryPolicy};
    use ch_core::to_rfc3339;
    use ch_db::{CreateTaskRequest, RegisterWorkerRequest, TaskMeta, WorkerMeta};
    use ch_hub::WorkerHub;
    use ch_lock::LockClient;
    use ch_obs::Metrics;
    use test_support::in_memory_db;

    async fn harness() -> (Arc<Dispatcher>, TaskUpdates, String) {
        let db = in_memory_db().await;
        let hub = Arc::new(WorkerHub::new(db.clone()));
        let locks = LockClient::new(db.pool().clone());
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            hub,
            locks,
            RetryPolicy::default(),
            DispatcherConfig::default(),
            Arc::new(Metrics::new()),
        ));

        let worker = WorkerRepository::new(db.pool())
            .register(RegisterWorkerRequest {
                name: "w1".to_string(),
                client_id: "c1".to_string(),
                meta: WorkerMeta::default(),
            })
            .await
            .unwrap();

        let updates = TaskUpdates::new(dispatcher.clone());
        (dispatcher, updates, worker.id)
    }

    async fn pending_task(d: &Dispatcher, retryable: bool) -> ch_db::Task {
        d.tasks()
            .create(CreateTaskRequest {
                team_id: "team-1".to_string(),
                cronjob_id: None,
                workflow_exec_id: None,
                step_order: None,
                category: "default".to_string(),
                command: "run.sh".to_string(),
                args: "{}".to_string(),
                description: String::new(),
                meta: TaskMeta::default(),
                status: ch_db::TaskStatus::Pending,
                save_log: true,
                time_plan: utc_now(),
                timeout_at: None,
                max_retry: if retryable { 2 } else { 0 },
                retryable,
                is_retry: false,
                retry_count: 0,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_claim_then_success() {
        let (d, updates, worker_id) = harness().await;
        let task = pending_task(&d, false).await;

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("running".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let running = d.tasks().find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(running.status, "running");
        assert_eq!(running.worker_name.as_deref(), Some("w1"));

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("success".to_string()),
                    output: Some("{\"rows\": 3}".to_string()),
                    time_end: Some(to_rfc3339(utc_now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = d.tasks().find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, "success");
        assert_eq!(done.output.as_deref(), Some("{\"rows\": 3}"));

        // save_log wrote the output chunk
        let log = TaskLogRepository::new(d.db().pool())
            .fetch(&task.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_late_claim_is_rejected() {
        let (d, updates, worker_id) = harness().await;
        let task = pending_task(&d, false).await;

        let other = WorkerRepository::new(d.db().pool())
            .register(RegisterWorkerRequest {
                name: "w2".to_string(),
                client_id: "c2".to_string(),
                meta: WorkerMeta::default(),
            })
            .await
            .unwrap();

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("running".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Second claim loses
        let late = updates
            .apply(
                &other.id,
                &task.id,
                TaskUpdateData {
                    status: Some("running".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(late, Err(Error::Conflict(_))));

        // Repeat claim from the winner is idempotent
        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("running".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_classifies_and_schedules_retry() {
        let (d, updates, worker_id) = harness().await;
        let task = pending_task(&d, true).await;

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("running".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("failed".to_string()),
                    output: Some("curl: connection refused".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = d.tasks().find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.failure_reason.as_deref(), Some("network_error"));
        // First retry window scheduled from the failure time
        let next = parse_rfc3339(failed.next_retry_time.as_deref().unwrap()).unwrap();
        assert!(next > utc_now() + chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_non_retryable_task_gets_no_retry_window() {
        let (d, updates, worker_id) = harness().await;
        let task = pending_task(&d, false).await;

        updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("failed".to_string()),
                    failure_reason: Some("bad_command".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = d.tasks().find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("bad_command"));
        assert!(failed.next_retry_time.is_none());
    }

    #[tokio::test]
    async fn test_worker_may_not_report_internal_states() {
        let (d, updates, worker_id) = harness().await;
        let task = pending_task(&d, false).await;

        let err = updates
            .apply(
                &worker_id,
                &task.id,
                TaskUpdateData {
                    status: Some("todo".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(err, Err(Error::BadRequest(_))));
    }
}
