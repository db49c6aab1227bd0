//! ABOUTME: Dispatch engine - materialises cronjobs into tasks and sweeps them
//! ABOUTME: Three leader-locked loops plus manual trigger/stop/retry/cancel ops

use async_trait::async_trait;
use ch_clock::{ClockError, CronExpr};
use ch_core::{parse_rfc3339, utc_now, Error, Result};
use ch_db::{
    CreateTaskRequest, CronJob, CronJobRepository, Db, Task, TaskRepository, TaskStatus,
};
use ch_hub::{TaskEvent, WorkerHub};
use ch_lock::{Lock, LockClient};
use ch_obs::Metrics;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod manual;
pub mod retry;
pub mod updates;

pub use retry::RetryPolicy;
pub use updates::TaskUpdates;

/// Leader lock keys, one per loop
const LOCK_DISPATCH: &str = "loop/dispatch";
const LOCK_TIMEOUT: &str = "loop/check_task";
const LOCK_RETRY: &str = "loop/check_failed";

/// Tick intervals and batch limits for the loops
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub dispatch_tick: std::time::Duration,
    pub timeout_tick: std::time::Duration,
    pub retry_tick: std::time::Duration,
    pub dispatch_batch_limit: i64,
    pub retry_batch_limit: i64,
    pub leader_lease: Duration,
    /// Grace before a stop escalates to kill
    pub stop_ack_grace: std::time::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatch_tick: std::time::Duration::from_secs(1),
            timeout_tick: std::time::Duration::from_secs(1),
            retry_tick: std::time::Duration::from_secs(30),
            dispatch_batch_limit: 200,
            retry_batch_limit: 100,
            leader_lease: Duration::seconds(30),
            stop_ack_grace: std::time::Duration::from_secs(10),
        }
    }
}

/// Observes tasks entering a terminal status (the workflow engine advances
/// its DAG through this seam).
#[async_trait]
pub trait TaskTerminalHook: Send + Sync {
    async fn on_task_terminal(&self, task: &Task) -> Result<()>;
}

/// The dispatch + execution state engine
pub struct Dispatcher {
    db: Db,
    hub: Arc<WorkerHub>,
    locks: LockClient,
    policy: RetryPolicy,
    config: DispatcherConfig,
    metrics: Arc<Metrics>,
    terminal_hook: RwLock<Option<Arc<dyn TaskTerminalHook>>>,
}

impl Dispatcher {
    pub fn new(
        db: Db,
        hub: Arc<WorkerHub>,
        locks: LockClient,
        policy: RetryPolicy,
        config: DispatcherConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            hub,
            locks,
            policy,
            config,
            metrics,
            terminal_hook: RwLock::new(None),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Register the terminal observer (one per process, wired in main)
    pub async fn set_terminal_hook(&self, hook: Arc<dyn TaskTerminalHook>) {
        *self.terminal_hook.write().await = Some(hook);
    }

    fn tasks(&self) -> TaskRepository<'_> {
        TaskRepository::with_backoff(self.db.pool(), self.policy.backoff.clone())
    }

    fn cronjobs(&self) -> CronJobRepository<'_> {
        CronJobRepository::new(self.db.pool())
    }

    /// Spawn all background loops; they stop when `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let d = self.clone();
        tokio::spawn(d.clone().run_leader_loop(
            LOCK_DISPATCH,
            self.config.dispatch_tick,
            cancel.clone(),
            |d| async move { d.dispatch_tick().await },
        ));

        let d = self.clone();
        tokio::spawn(d.clone().run_leader_loop(
            LOCK_TIMEOUT,
            self.config.timeout_tick,
            cancel.clone(),
            |d| async move { d.timeout_tick().await },
        ));

        let d = self.clone();
        tokio::spawn(d.clone().run_leader_loop(
            LOCK_RETRY,
            self.config.retry_tick,
            cancel,
            |d| async move { d.retry_tick().await },
        ));

        info!("Dispatcher loops started");
    }

    /// Leader-elected loop skeleton: hold the loop's lock with auto-refresh
    /// while leading; non-leaders keep probing each tick. Tick failures are
    /// logged and retried next tick; the loop never panics.
    async fn run_leader_loop<F, Fut>(
        self: Arc<Self>,
        key: &'static str,
        tick: std::time::Duration,
        cancel: CancellationToken,
        tick_fn: F,
    ) where
        F: Fn(Arc<Dispatcher>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let lease = self.config.leader_lease;
        let refresh_every =
            std::time::Duration::from_secs((lease.num_seconds() as u64 / 3).max(1));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leadership: Option<(Lock, ch_lock::AutoRefresh)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some((lock, refresher)) = leadership.take() {
                        refresher.stop().await;
                        if let Err(e) = self.locks.release(&lock).await {
                            warn!(key, error = %e, "Failed to release leader lock on shutdown");
                        }
                    }
                    info!(key, "Loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if leadership.is_none() {
                        match self.locks.try_acquire(key, lease).await {
                            Ok(lock) => {
                                info!(key, "Loop leadership acquired");
                                let refresher =
                                    self.locks.auto_refresh(lock.clone(), lease, refresh_every);
                                leadership = Some((lock, refresher));
                            }
                            Err(Error::LockHeld(_)) => {
                                self.metrics.inc_lock_contention();
                                continue;
                            }
                            Err(e) => {
                                warn!(key, error = %e, "Leader probe failed");
                                continue;
                            }
                        }
                    }

                    if let Err(e) = tick_fn(self.clone()).await {
                        warn!(key, error = %e, "Loop tick failed");
                    }
                }
            }
        }
    }

    /// One dispatch iteration: seed new schedules, then fire everything due
    async fn dispatch_tick(self: Arc<Self>) -> Result<()> {
        let now = utc_now();
        let cronjobs = self.cronjobs();

        cronjobs.batch_initialise_last_plan(now).await?;

        let due = cronjobs.due(now, self.config.dispatch_batch_limit).await?;
        for job in due {
            // Per-job sub-lock: a single cronjob is fired by at most one
            // replica iteration at a time.
            let key = format!("dispatch/cronjob/{}", job.id);
            let sub_lock = match self.locks.try_acquire(&key, Duration::seconds(30)).await {
                Ok(lock) => lock,
                Err(Error::LockHeld(_)) => {
                    self.metrics.inc_lock_contention();
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self.fire_cronjob(&job, now).await {
                warn!(cronjob_id = %job.id, error = %e, "Failed to fire cronjob");
            }

            if let Err(e) = self.locks.release(&sub_lock).await {
                warn!(cronjob_id = %job.id, error = %e, "Failed to release cronjob sub-lock");
            }
        }

        Ok(())
    }

    /// Materialise one pending task from a due cronjob and advance its plan
    async fn fire_cronjob(&self, job: &CronJob, now: DateTime<Utc>) -> Result<()> {
        let expr: CronExpr = match job.expression.parse() {
            Ok(expr) => expr,
            Err(e) => {
                // Authoring slipped a bad expression through; the job can
                // never fire again so it is taken out of rotation.
                self.cronjobs().deactivate(&job.id, &e.to_string()).await?;
                return Ok(());
            }
        };

        let next = match expr.next(now) {
            Ok(next) => next,
            Err(ClockError::Unreachable) => {
                self.cronjobs()
                    .deactivate(&job.id, "schedule has no reachable fire time")
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.cronjobs().deactivate(&job.id, &e.to_string()).await?;
                return Ok(());
            }
        };

        let time_plan = match &job.last_plan {
            Some(plan) => parse_rfc3339(plan)?,
            None => now,
        };
        let timeout_at = if job.timeout_secs > 0 {
            Some(now + Duration::seconds(job.timeout_secs))
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
                description: job.description.clone(),
                meta: job.parse_meta()?,
                status: TaskStatus::Pending,
                save_log: job.save_log,
                time_plan,
                timeout_at,
                max_retry: job.max_retry,
                retryable: job.retryable,
                is_retry: false,
                retry_count: 0,
            })
            .await?;

        self.cronjobs().set_last_plan(&job.id, next).await?;
        self.metrics.inc_dispatched();

        // Store writes are committed before the session send
        let delivered = self.hub.push_run(&task).await?;
        if delivered == 0 {
            debug!(task_id = %task.id, "Task pending with no eligible worker connected");
        } else {
            debug!(task_id = %task.id, delivered, "Task dispatched");
        }

        Ok(())
    }

    /// One timeout sweep: deadline-based, so it survives process restarts
    async fn timeout_tick(self: Arc<Self>) -> Result<()> {
        let now = utc_now();
        let expired = self.tasks().pending_expired(now).await?;

        for task in expired {
            let patched = self
                .tasks()
                .patch(
                    &task.id,
                    ch_db::TaskPatch {
                        status: Some(TaskStatus::Timeout),
                        failure_reason: Some(retry::REASON_TIMEOUT.to_string()),
                        time_end: Some(now),
                        ..Default::default()
                    },
                )
                .await;

            let patched = match patched {
                Ok(task) => task,
                Err(Error::Fatal(_)) => continue, // lost the race to a worker report
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Timeout transition failed");
                    continue;
                }
            };

            self.metrics.inc_completed("timeout");
            warn!(task_id = %patched.id, "Task timed out");

            // Workers that still run it should abandon on sight
            self.hub.broadcast(TaskEvent::timeout(patched.clone())).await;
            self.notify_terminal(&patched).await;
        }

        Ok(())
    }

    /// One retry sweep: clone due failures into fresh pending tasks
    async fn retry_tick(self: Arc<Self>) -> Result<()> {
        let now = utc_now();
        let candidates = self
            .tasks()
            .need_retry(now, self.config.retry_batch_limit)
            .await?;

        for origin in candidates {
            if !self.policy.is_retry_ready(&origin, now)? {
                if !self.policy.should_retry(&origin)? {
                    // Stale beyond the grace window: stop re-scanning it
                    self.tasks()
                        .patch(
                            &origin.id,
                            ch_db::TaskPatch {
                                retryable: Some(false),
                                next_retry_time: Some(None),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                continue;
            }

            if let Err(e) = self.spawn_and_dispatch_retry(&origin, now).await {
                warn!(task_id = %origin.id, error = %e, "Retry spawn failed");
            }
        }

        Ok(())
    }

    /// Clone an origin into a retry task and broadcast it
    pub(crate) async fn spawn_and_dispatch_retry(
        &self,
        origin: &Task,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        // Preserve the origin's deadline window relative to its plan
        let timeout_at = match (&origin.timeout_at, &origin.time_plan) {
            (Some(timeout_at), plan) => {
                let window = parse_rfc3339(timeout_at)? - parse_rfc3339(plan)?;
                Some(now + window)
            }
            (None, _) => None,
        };

        let clone = self.tasks().spawn_retry(origin, now, timeout_at).await?;
        self.metrics.inc_retried();
        info!(
            origin = %origin.id,
            retry_task = %clone.id,
            attempt = clone.retry_count,
            "Retry task dispatched"
        );

        let delivered = self.hub.push_run(&clone).await?;
        if delivered == 0 {
            debug!(task_id = %clone.id, "Retry task pending with no eligible worker");
        }
        Ok(clone)
    }

    /// Forward a terminal task to the registered observer
    pub(crate) async fn notify_terminal(&self, task: &Task) {
        if task.workflow_exec_id.is_none() {
            return;
        }
        let hook = self.terminal_hook.read().await.clone();
        if let Some(hook) = hook {
            if let Err(e) = hook.on_task_terminal(task).await {
                warn!(task_id = %task.id, error = %e, "Terminal hook failed");
            }
        }
    }
}
