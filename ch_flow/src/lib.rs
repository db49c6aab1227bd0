//! ABOUTME: Workflow execution engine - orders tasks by step and advances a DAG
//! ABOUTME: Batch activation, wait/failure strategies, env-lock, completion

use async_trait::async_trait;
use ch_core::{utc_now, Error, Result};
use ch_db::{
    CreateTaskRequest, Db, FailureStrategy, ProgressUpdate, Step, Task, TaskPatch, TaskRepository,
    TaskStatus, WaitStrategy, WorkflowExecute, WorkflowExecuteRepository, WorkflowExecuteStatus,
    WorkflowRepository,
};
use ch_dispatch::TaskTerminalHook;
use ch_hub::{TaskEvent, WorkerHub};
use ch_lock::{Lock, LockClient};
use ch_obs::Metrics;
use chrono::Duration;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod expr;
pub mod vars;
pub mod webhook;

pub use webhook::WebhookGate;

/// Request to start a workflow run
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub team_id: String,
    pub workflow_id: String,
    pub trigger_user: String,
    pub initial_variables: HashMap<String, Value>,
}

/// The workflow execution engine
///
/// All advancement for one execute is serialised through a per-execute
/// distributed lock, so batch activation is monotone across replicas.
pub struct WorkflowEngine {
    db: Db,
    hub: Arc<WorkerHub>,
    locks: LockClient,
    metrics: Arc<Metrics>,
    default_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(
        db: Db,
        hub: Arc<WorkerHub>,
        locks: LockClient,
        metrics: Arc<Metrics>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            db,
            hub,
            locks,
            metrics,
            default_timeout,
        }
    }

    fn tasks(&self) -> TaskRepository<'_> {
        TaskRepository::new(self.db.pool())
    }

    fn workflows(&self) -> WorkflowRepository<'_> {
        WorkflowRepository::new(self.db.pool())
    }

    fn executes(&self) -> WorkflowExecuteRepository<'_> {
        WorkflowExecuteRepository::new(self.db.pool())
    }

    /// Serialise advancement for one execute across replicas
    async fn lock_execute(&self, we_id: &str) -> Result<Lock> {
        let key = format!("flow/execute/{}", we_id);
        for _ in 0..50 {
            match self.locks.try_acquire(&key, Duration::seconds(30)).await {
                Ok(lock) => return Ok(lock),
                Err(Error::LockHeld(_)) => {
                    self.metrics.inc_lock_contention();
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::LockHeld(format!(
            "Workflow execute {} is busy",
            we_id
        )))
    }

    async fn unlock(&self, lock: Lock) {
        if let Err(e) = self.locks.release(&lock).await {
            warn!(key = %lock.key, error = %e, "Failed to release execute lock");
        }
    }

    /// Start a workflow run: create the execute, insert one todo task per
    /// step in a single transaction, then activate the first batch.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<WorkflowExecute> {
        let workflow = self
            .workflows()
            .get(&request.team_id, &request.workflow_id)
            .await?;
        if !workflow.is_active {
            return Err(Error::BadRequest(format!(
                "Workflow {} is not active",
                workflow.id
            )));
        }

        let steps = workflow.parse_steps()?;
        ch_db::repositories::workflows::validate_steps(&steps)?;
        for step in &steps {
            if !step.condition.is_empty() {
                expr::parse(&step.condition)?;
            }
        }

        let mut variables = workflow.parse_default_variables()?;
        vars::merge(&mut variables, &request.initial_variables);

        let now = utc_now();
        let we = self
            .executes()
            .create(
                &request.team_id,
                &workflow.id,
                &request.trigger_user,
                &variables,
                steps.len() as i64,
                Some(now + self.default_timeout),
            )
            .await?;

        self.workflows().record_execute_started(&workflow.id).await?;
        self.metrics.inc_workflow_execute();
        info!(
            execute_id = %we.id,
            workflow = %workflow.name,
            steps = steps.len(),
            user = %request.trigger_user,
            "Workflow execute started"
        );

        let requests = steps
            .iter()
            .map(|step| CreateTaskRequest {
                team_id: request.team_id.clone(),
                cronjob_id: None,
                workflow_exec_id: Some(we.id.clone()),
                step_order: Some(step.order),
                category: step.category.clone(),
                command: step.command.clone(),
                args: step.args.clone(),
                description: step.name.clone(),
                meta: Default::default(),
                status: TaskStatus::Todo,
                save_log: false,
                time_plan: now,
                timeout_at: None,
                max_retry: 0,
                retryable: false,
                is_retry: false,
                retry_count: 0,
            })
            .collect();
        self.tasks().create_many(requests).await?;

        let lock = self.lock_execute(&we.id).await?;
        let advanced = self.advance(&we.id, None).await;
        self.unlock(lock).await;
        advanced?;

        self.executes()
            .find_by_id(&we.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow execute {} vanished", we.id)))
    }

    /// Webhook entry: authorize, then execute with the request body as the
    /// initial variables.
    pub async fn execute_webhook(
        &self,
        gate: &WebhookGate,
        workflow_id: &str,
        key: &str,
        source: std::net::IpAddr,
        body: HashMap<String, Value>,
    ) -> Result<WorkflowExecute> {
        let workflow = self
            .workflows()
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {} not found", workflow_id)))?;

        gate.authorize(&workflow, key, source)?;

        self.execute(ExecuteRequest {
            team_id: workflow.team_id.clone(),
            workflow_id: workflow.id.clone(),
            trigger_user: format!("webhook:{}", source),
            initial_variables: body,
        })
        .await
    }

    /// Cancel a run; allowed only while it is pending or running
    pub async fn cancel(&self, team_id: &str, we_id: &str, user: &str) -> Result<WorkflowExecute> {
        let lock = self.lock_execute(we_id).await?;
        let result = self.cancel_locked(team_id, we_id, user).await;
        self.unlock(lock).await;
        result
    }

    async fn cancel_locked(
        &self,
        team_id: &str,
        we_id: &str,
        user: &str,
    ) -> Result<WorkflowExecute> {
        let we = self.executes().get(team_id, we_id).await?;
        if we.status()?.is_terminal() {
            return Err(Error::BadRequest(format!(
                "Workflow execute {} already finished ({})",
                we_id, we.status
            )));
        }

        self.cancel_remaining_tasks(we_id).await?;

        let tasks = self.tasks().list_by_workflow_exec(we_id).await?;
        let counters = Counters::from_tasks(&tasks)?;
        let updated = self
            .executes()
            .apply_progress(
                we_id,
                ProgressUpdate {
                    status: Some(WorkflowExecuteStatus::Canceled),
                    error_message: Some(format!("canceled by {}", user)),
                    completed_steps: Some(counters.completed),
                    success_steps: Some(counters.success),
                    failed_steps: Some(counters.failed),
                    finished_at: Some(utc_now()),
                    ..Default::default()
                },
            )
            .await?;

        self.workflows()
            .record_execute_finished(&we.workflow_id, "canceled")
            .await?;
        info!(execute_id = %we_id, user, "Workflow execute canceled");
        Ok(updated)
    }

    /// Expire runs past their deadline; wired as a small background loop
    pub async fn start_expiry_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Workflow expiry loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Workflow expiry loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.expire_overdue().await {
                        warn!(error = %e, "Workflow expiry sweep failed");
                    }
                }
            }
        }
    }

    async fn expire_overdue(&self) -> Result<()> {
        let overdue = self.executes().running_expired(utc_now()).await?;
        for we in overdue {
            let lock = self.lock_execute(&we.id).await?;
            let result: Result<()> = async {
                let current = match self.executes().find_by_id(&we.id).await? {
                    Some(current) if !current.status()?.is_terminal() => current,
                    _ => return Ok(()),
                };

                self.cancel_remaining_tasks(&current.id).await?;
                let tasks = self.tasks().list_by_workflow_exec(&current.id).await?;
                let counters = Counters::from_tasks(&tasks)?;
                self.executes()
                    .apply_progress(
                        &current.id,
                        ProgressUpdate {
                            status: Some(WorkflowExecuteStatus::Failed),
                            error_message: Some("workflow execute timed out".to_string()),
                            completed_steps: Some(counters.completed),
                            success_steps: Some(counters.success),
                            failed_steps: Some(counters.failed),
                            finished_at: Some(utc_now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.workflows()
                    .record_execute_finished(&current.workflow_id, "failed")
                    .await?;
                warn!(execute_id = %current.id, "Workflow execute timed out");
                Ok(())
            }
            .await;
            self.unlock(lock).await;
            result?;
        }
        Ok(())
    }

    /// Apply one terminal task and advance the DAG. Called from the
    /// dispatcher's terminal seam.
    async fn handle_terminal(&self, task: &Task) -> Result<()> {
        let Some(we_id) = task.workflow_exec_id.clone() else {
            return Ok(());
        };

        let lock = self.lock_execute(&we_id).await?;
        let result = self.advance(&we_id, Some(task)).await;
        self.unlock(lock).await;
        result
    }

    /// Advance one execute: merge the finished task's output, record the
    /// environment lock, enforce failure strategies, activate every batch
    /// whose gate is satisfied, and settle completion. One WE row write.
    async fn advance(&self, we_id: &str, finished: Option<&Task>) -> Result<()> {
        let we = self
            .executes()
            .find_by_id(we_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow execute {} not found", we_id)))?;
        if we.status()?.is_terminal() {
            // Late worker reports after cancel/abort are ignored
            return Ok(());
        }

        let workflow = self
            .workflows()
            .find_by_id(&we.workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {} not found", we.workflow_id)))?;
        let steps = workflow.parse_steps()?;

        let mut variables = we.parse_variables()?;
        let mut locked = we.is_locked();

        // Parameter propagation and environment lock from the finished task
        if let Some(task) = finished {
            let status = task.status()?;
            let meta = task.parse_meta()?;
            if status == TaskStatus::Success && !meta.skipped {
                vars::merge(&mut variables, &vars::output_bag(task.output.as_deref()));
            }
            if status == TaskStatus::Success && !locked {
                if let (Some(worker_id), Some(worker_name)) = (&task.worker_id, &task.worker_name)
                {
                    let took = self
                        .executes()
                        .set_env_lock(we_id, worker_id, worker_name, meta.working_dir.as_deref())
                        .await?;
                    if took {
                        info!(
                            execute_id = %we_id,
                            worker = %worker_name,
                            "Environment locked to first successful worker"
                        );
                    }
                    locked = true;
                }
            }
        }

        // Reload the lock fields if another path set them
        let we = self
            .executes()
            .find_by_id(we_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow execute {} not found", we_id)))?;

        let mut tasks = self.tasks().list_by_workflow_exec(we_id).await?;
        let batches = compute_batches(&steps);

        let mut aborted: Option<(i64, String)> = None;
        for batch in &batches {
            let members = batch_members(batch, &tasks)?;

            // Reaching this batch means every earlier gate was satisfied;
            // activate whatever is still waiting (all of it on the happy
            // path, the remainder after a mid-activation crash).
            let has_todo = members.iter().any(|(_, t)| t.status == "todo");
            if has_todo {
                self.activate_batch(&we, batch, &variables, &tasks).await?;
                tasks = self.tasks().list_by_workflow_exec(we_id).await?;
            }

            let members = batch_members(batch, &tasks)?;

            // Failure strategy: the first non-success terminal member under
            // abort cancels the run.
            let strategy = batch[0].failure_strategy;
            if strategy == FailureStrategy::Abort {
                if let Some((step, task)) = members.iter().find(|(_, t)| {
                    TaskStatus::parse(&t.status)
                        .map(|s| s.is_terminal() && s != TaskStatus::Success)
                        .unwrap_or(false)
                }) {
                    aborted = Some((step.order, task.id.clone()));
                    break;
                }
            }

            if !gate_satisfied(batch[0].wait_strategy, &members)? {
                // A fully settled batch that can never satisfy its gate
                // starves the rest of the workflow.
                let all_terminal = members.iter().all(|(_, t)| {
                    TaskStatus::parse(&t.status).map(|s| s.is_terminal()).unwrap_or(false)
                });
                if all_terminal {
                    aborted = Some((batch[0].order, String::new()));
                }
                break;
            }
        }

        if let Some((failed_order, failed_task)) = aborted {
            self.cancel_remaining_tasks(we_id).await?;
            let tasks = self.tasks().list_by_workflow_exec(we_id).await?;
            let counters = Counters::from_tasks(&tasks)?;
            let message = if failed_task.is_empty() {
                format!("step {} did not meet its wait strategy", failed_order)
            } else {
                format!("step {} failed", failed_order)
            };

            self.executes()
                .apply_progress(
                    we_id,
                    ProgressUpdate {
                        status: Some(WorkflowExecuteStatus::Failed),
                        variables: Some(variables),
                        error_message: Some(message),
                        failed_step_order: Some(failed_order),
                        completed_steps: Some(counters.completed),
                        success_steps: Some(counters.success),
                        failed_steps: Some(counters.failed),
                        current_step: Some(counters.current_step),
                        finished_at: Some(utc_now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.workflows()
                .record_execute_finished(&we.workflow_id, "failed")
                .await?;
            warn!(execute_id = %we_id, failed_step = failed_order, "Workflow execute failed");
            return Ok(());
        }

        // Completion check over the refreshed task set
        let counters = Counters::from_tasks(&tasks)?;
        let settled = counters.completed == counters.total;

        if settled {
            let (status, record) = if counters.failed > 0 {
                (WorkflowExecuteStatus::Failed, "failed")
            } else {
                (WorkflowExecuteStatus::Success, "success")
            };
            let failed_step_order = first_failed_order(&tasks)?;

            self.executes()
                .apply_progress(
                    we_id,
                    ProgressUpdate {
                        status: Some(status),
                        variables: Some(variables),
                        completed_steps: Some(counters.completed),
                        success_steps: Some(counters.success),
                        failed_steps: Some(counters.failed),
                        current_step: Some(counters.current_step),
                        error_message: failed_step_order.map(|o| format!("step {} failed", o)),
                        failed_step_order,
                        finished_at: Some(utc_now()),
                        ..Default::default()
                    },
                )
                .await?;
            self.workflows()
                .record_execute_finished(&we.workflow_id, record)
                .await?;
            info!(execute_id = %we_id, status = record, "Workflow execute finished");
        } else {
            self.executes()
                .apply_progress(
                    we_id,
                    ProgressUpdate {
                        status: Some(WorkflowExecuteStatus::Running),
                        variables: Some(variables),
                        completed_steps: Some(counters.completed),
                        success_steps: Some(counters.success),
                        failed_steps: Some(counters.failed),
                        current_step: Some(counters.current_step),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Activate every member of a batch: evaluate its condition, substitute
    /// variables into args, apply the environment lock, go pending, push run.
    async fn activate_batch(
        &self,
        we: &WorkflowExecute,
        batch: &[&Step],
        variables: &HashMap<String, Value>,
        tasks: &[Task],
    ) -> Result<()> {
        let now = utc_now();

        for step in batch {
            let task = task_for_order(tasks, step.order)?;
            if task.status()? != TaskStatus::Todo {
                continue;
            }

            // Condition context: variables plus the previous step's outcome
            let mut ctx = variables.clone();
            if let Some(prev) = previous_terminal(tasks, step.order) {
                ctx.insert(
                    "task_status".to_string(),
                    Value::String(prev.status.clone()),
                );
                ctx.insert(
                    "output".to_string(),
                    Value::String(prev.output.clone().unwrap_or_default()),
                );
                if let Some(code) = vars::output_bag(prev.output.as_deref()).remove("exit_code") {
                    ctx.insert("exit_code".to_string(), code);
                }
            }

            if !expr::evaluate(&step.condition, &ctx)? {
                // Skip immediately, never delaying siblings
                let mut meta = task.parse_meta()?;
                meta.skipped = true;
                self.tasks()
                    .patch(
                        &task.id,
                        TaskPatch {
                            status: Some(TaskStatus::Success),
                            meta: Some(meta),
                            time_end: Some(now),
                            ..Default::default()
                        },
                    )
                    .await?;
                debug!(execute_id = %we.id, step = step.order, "Step skipped by condition");
                continue;
            }

            let mut meta = task.parse_meta()?;
            if let (Some(name), Some(_)) = (&we.locked_worker_name, &we.locked_worker_id) {
                // Hard selectors after the environment lock
                meta.worker_select = vec![name.clone()];
                meta.working_dir = we.locked_working_dir.clone();
            }

            let timeout_at = if step.timeout_secs > 0 {
                Some(Some(now + Duration::seconds(step.timeout_secs)))
            } else {
                None
            };

            let activated = self
                .tasks()
                .patch(
                    &task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Pending),
                        args: Some(vars::substitute(&step.args, variables)),
                        meta: Some(meta),
                        timeout_at,
                        ..Default::default()
                    },
                )
                .await?;

            self.metrics.inc_step_activated();
            debug!(execute_id = %we.id, step = step.order, task_id = %activated.id, "Step activated");

            let delivered = self.hub.push_run(&activated).await?;
            if delivered == 0 {
                debug!(task_id = %activated.id, "Step pending with no eligible worker");
            }
        }

        Ok(())
    }

    /// Cancel every task that has not finished; running ones get a stop event
    async fn cancel_remaining_tasks(&self, we_id: &str) -> Result<()> {
        let tasks = self.tasks().list_by_workflow_exec(we_id).await?;
        let now = utc_now();

        for task in tasks {
            let status = task.status()?;
            if status.is_terminal() {
                continue;
            }
            let was_running = status == TaskStatus::Running;
            let canceled = self
                .tasks()
                .patch(
                    &task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Canceled),
                        time_end: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            if was_running {
                self.hub.broadcast(TaskEvent::stop(canceled)).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskTerminalHook for WorkflowEngine {
    async fn on_task_terminal(&self, task: &Task) -> Result<()> {
        self.handle_terminal(task).await
    }
}

/// Step counters derived from the task set
struct Counters {
    total: i64,
    completed: i64,
    success: i64,
    failed: i64,
    current_step: i64,
}

impl Counters {
    fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut completed = 0;
        let mut success = 0;
        let mut current_step = 0;
        for task in tasks {
            let status = task.status()?;
            if status != TaskStatus::Todo {
                current_step = current_step.max(task.step_order.unwrap_or(0));
            }
            if status.is_terminal() {
                completed += 1;
                if status == TaskStatus::Success {
                    success += 1;
                }
            }
        }
        Ok(Self {
            total: tasks.len() as i64,
            completed,
            success,
            failed: completed - success,
            current_step,
        })
    }
}

/// Maximal prefixes of equal `parallel_group`; empty group = singleton batch
fn compute_batches(steps: &[Step]) -> Vec<Vec<&Step>> {
    let mut batches: Vec<Vec<&Step>> = Vec::new();
    for step in steps {
        match batches.last_mut() {
            Some(last)
                if !step.parallel_group.is_empty()
                    && last[0].parallel_group == step.parallel_group =>
            {
                last.push(step);
            }
            _ => batches.push(vec![step]),
        }
    }
    batches
}

fn batch_members<'a>(batch: &[&'a Step], tasks: &'a [Task]) -> Result<Vec<(&'a Step, &'a Task)>> {
    batch
        .iter()
        .map(|step| task_for_order(tasks, step.order).map(|t| (*step, t)))
        .collect()
}

fn task_for_order(tasks: &[Task], order: i64) -> Result<&Task> {
    tasks
        .iter()
        .find(|t| t.step_order == Some(order))
        .ok_or_else(|| Error::Fatal(format!("No task for workflow step {}", order)))
}

/// Latest finished step before `order`, for the condition context
fn previous_terminal(tasks: &[Task], order: i64) -> Option<&Task> {
    tasks
        .iter()
        .filter(|t| {
            t.step_order.map(|o| o < order).unwrap_or(false)
                && TaskStatus::parse(&t.status)
                    .map(|s| s.is_terminal())
                    .unwrap_or(false)
        })
        .max_by_key(|t| t.step_order)
}

fn first_failed_order(tasks: &[Task]) -> Result<Option<i64>> {
    for task in tasks {
        let status = task.status()?;
        if status.is_terminal() && status != TaskStatus::Success {
            return Ok(task.step_order);
        }
    }
    Ok(None)
}

/// Is the batch's wait strategy satisfied by its members' statuses?
fn gate_satisfied(strategy: WaitStrategy, members: &[(&Step, &Task)]) -> Result<bool> {
    let mut terminal = 0;
    let mut successes = 0;
    for (_, task) in members {
        let status = task.status()?;
        if status.is_terminal() {
            terminal += 1;
            if status == TaskStatus::Success {
                successes += 1;
            }
        }
    }

    Ok(match strategy {
        WaitStrategy::All => terminal == members.len(),
        WaitStrategy::Any => successes >= 1,
        WaitStrategy::Threshold(n) => successes >= n as usize,
    })
}
