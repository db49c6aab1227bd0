//! ABOUTME: Synchronous operator surface - trigger, retry, stop, cancel
//! ABOUTME: Every call is tenant-checked; stop escalates to kill after a grace

use ch_core::{utc_now, Error, Result};
use ch_db::{CreateTaskRequest, Task, TaskPatch, TaskStatus};
use ch_hub::TaskEvent;
use std::sync::Arc;
use tracing::{info, warn};

use crate::Dispatcher;

impl Dispatcher {
    /// Run a cronjob once, now, outside its schedule
    pub async fn execute_cronjob(&self, team_id: &str, cronjob_id: &str, user: &str) -> Result<Task> {
        let job = self.cronjobs().get(team_id, cronjob_id).await?;
        let now = utc_now();

        let timeout_at = if job.timeout_secs > 0 {
            Some(now + chrono::Duration::seconds(job.timeout_secs))
        } else {
            None
        };

        let task = self
            .tasks()
            .create(CreateTaskRequest {
                team_id: job.team_id.clone(),
                cronjob_id: Some(job.id.clone()),
                workflow_exec_id: None,
                step_order: None,
                category: job.category.clone(),
                command: job.command.clone(),
                args: job.args.clone(),
                description: format!("manual run by {}", user),
                meta: job.parse_meta()?,
                status: TaskStatus::Pending,
                save_log: job.save_log,
                time_plan: now,
                timeout_at,
                max_retry: job.max_retry,
                retryable: job.retryable,
                is_retry: false,
                retry_count: 0,
            })
            .await?;

        self.metrics().inc_dispatched();
        info!(cronjob_id, task_id = %task.id, user, "Manual cronjob execution");

        self.hub().push_run(&task).await?;
        Ok(task)
    }

    /// Manually trigger the retry clone path, regardless of schedule
    pub async fn retry_task(&self, team_id: &str, task_id: &str) -> Result<Task> {
        let task = self.tasks().get(team_id, task_id).await?;

        let status = task.status()?;
        if !matches!(status, TaskStatus::Failed | TaskStatus::Error) {
            return Err(Error::BadRequest(format!(
                "Task {} is {}, only failed or error tasks retry",
                task_id, status
            )));
        }
        if task.retry_count >= task.max_retry {
            return Err(Error::BadRequest(format!(
                "Task {} has exhausted its retry budget",
                task_id
            )));
        }

        self.spawn_and_dispatch_retry(&task, utc_now()).await
    }

    /// Stop a running task; without a prompt worker ack, escalate to kill
    pub async fn stop_task(self: &Arc<Self>, team_id: &str, task_id: &str) -> Result<Task> {
        let task = self.tasks().get(team_id, task_id).await?;

        if task.status()? != TaskStatus::Running {
            return Err(Error::BadRequest(format!(
                "Task {} is {}, only running tasks can be stopped",
                task_id, task.status
            )));
        }

        let stopped = self
            .tasks()
            .patch(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Stopped),
                    time_end: Some(utc_now()),
                    ..Default::default()
                },
            )
            .await?;
        self.metrics().inc_completed("stopped");
        info!(task_id, "Task stopped");

        let worker_name = stopped.worker_name.clone().unwrap_or_default();
        let delivered = self
            .hub()
            .send_to_worker(&worker_name, TaskEvent::stop(stopped.clone()))
            .await?;

        // Escalate if the worker session is gone or stays silent
        let grace = self.config.stop_ack_grace;
        let dispatcher = self.clone();
        let kill_target = stopped.clone();
        tokio::spawn(async move {
            if delivered {
                tokio::time::sleep(grace).await;
            }
            let event = TaskEvent::kill(kill_target.clone());
            match dispatcher.hub().send_to_worker(&worker_name, event).await {
                Ok(true) => info!(task_id = %kill_target.id, "Kill escalation sent"),
                Ok(false) => {}
                Err(e) => warn!(task_id = %kill_target.id, error = %e, "Kill escalation failed"),
            }
        });

        self.notify_terminal(&stopped).await;
        Ok(stopped)
    }

    /// Cancel a task that has not been claimed yet
    pub async fn cancel_task(&self, team_id: &str, task_id: &str) -> Result<Task> {
        let task = self.tasks().get(team_id, task_id).await?;

        if !matches!(task.status()?, TaskStatus::Pending | TaskStatus::Todo) {
            return Err(Error::BadRequest(format!(
                "Task {} is {}, only unclaimed tasks can be canceled",
                task_id, task.status
            )));
        }

        let canceled = self
            .tasks()
            .patch(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Canceled),
                    time_end: Some(utc_now()),
                    ..Default::default()
                },
            )
            .await?;
        self.metrics().inc_completed("canceled");
        info!(task_id, "Task canceled");

        self.notify_terminal(&canceled).await;
        Ok(canceled)
    }
}
