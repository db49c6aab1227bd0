//! ABOUTME: Registry of connected worker sessions with routed broadcast
//! ABOUTME: Owns worker liveness: registration binding and the inactivity sweep

use async_trait::async_trait;
use ch_core::{utc_now, Result};
use ch_db::{Db, RegisterWorkerRequest, WorkerMeta, WorkerRepository};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod events;
pub mod listener;
pub mod session;

pub use events::{
    ClientAction, ClientEvent, EventAction, RegisterWorkerData, TaskEvent, TaskUpdateData,
};
pub use session::{ChannelSession, Session};

use ch_db::{Task, TaskMeta};

/// Capability binding of a connected session
#[derive(Debug, Clone)]
pub struct RegisteredWorker {
    pub worker_id: String,
    pub name: String,
    pub meta: WorkerMeta,
}

struct SessionEntry {
    session: Arc<dyn Session>,
    worker: Option<RegisteredWorker>,
}

/// Receives `task_update` payloads ingested from worker sessions
#[async_trait]
pub trait TaskUpdateSink: Send + Sync {
    async fn apply(&self, worker_id: &str, task_id: &str, update: TaskUpdateData) -> Result<()>;
}

/// Process-wide registry of live worker sessions
///
/// Add/remove take the write lock; send/broadcast run under the read lock.
/// Sessions that fail a send are evicted and the task stays pending for the
/// next broadcast or the timeout sweep.
pub struct WorkerHub {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    db: Db,
}

impl WorkerHub {
    pub fn new(db: Db) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            db,
        }
    }

    /// Add a freshly accepted session (not yet bound to a worker)
    pub async fn add(&self, session: Arc<dyn Session>) {
        let id = session.id().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id.clone(),
            SessionEntry {
                session,
                worker: None,
            },
        );
        debug!(client_id = %id, total = sessions.len(), "Session added");
    }

    /// Drop a session by client id
    pub async fn remove(&self, client_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.remove(client_id) {
            entry.session.close();
            debug!(client_id, total = sessions.len(), "Session removed");
        }
    }

    /// Number of live sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Bind a `regist_worker` advertisement to its session, upserting the
    /// worker row.
    pub async fn register_worker(&self, client_id: &str, data: RegisterWorkerData) -> Result<()> {
        let repo = WorkerRepository::new(self.db.pool());
        let worker = repo
            .register(RegisterWorkerRequest {
                name: data.name.clone(),
                client_id: client_id.to_string(),
                meta: data.metadata.clone(),
            })
            .await?;

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(client_id) {
            entry.worker = Some(RegisteredWorker {
                worker_id: worker.id,
                name: data.name,
                meta: data.metadata,
            });
        } else {
            warn!(client_id, worker = %data.name, "Registration for unknown session");
        }
        Ok(())
    }

    /// Refresh liveness on ping
    pub async fn touch_worker(&self, worker_id: &str) -> Result<()> {
        WorkerRepository::new(self.db.pool())
            .touch(worker_id, utc_now())
            .await
    }

    /// Workers currently bound to a live session
    pub async fn list_workers(&self) -> Vec<RegisteredWorker> {
        self.sessions
            .read()
            .await
            .values()
            .filter_map(|e| e.worker.clone())
            .collect()
    }

    /// Send to every live session regardless of binding; failed sessions are
    /// evicted. Returns the number of successful deliveries.
    pub async fn broadcast(&self, event: TaskEvent) -> usize {
        let targets: Vec<(String, Arc<dyn Session>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, e)| (id.clone(), e.session.clone()))
                .collect()
        };
        self.deliver(targets, event).await
    }

    /// Route a run event to every eligible worker session. All matching
    /// workers receive it; the first status claim wins at the store.
    pub async fn push_run(&self, task: &Task) -> Result<usize> {
        let meta = task.parse_meta()?;
        let targets: Vec<(String, Arc<dyn Session>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, e)| {
                    e.worker
                        .as_ref()
                        .map(|w| worker_matches(&meta, &task.category, w))
                        .unwrap_or(false)
                })
                .map(|(id, e)| (id.clone(), e.session.clone()))
                .collect()
        };

        if targets.is_empty() {
            debug!(task_id = %task.id, "No eligible worker connected");
            return Ok(0);
        }

        Ok(self.deliver(targets, TaskEvent::run(task.clone())).await)
    }

    /// Send an event to the session bound to a worker name
    pub async fn send_to_worker(&self, worker_name: &str, event: TaskEvent) -> Result<bool> {
        let target: Option<(String, Arc<dyn Session>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .find(|(_, e)| {
                    e.worker
                        .as_ref()
                        .map(|w| w.name == worker_name)
                        .unwrap_or(false)
                })
                .map(|(id, e)| (id.clone(), e.session.clone()))
        };

        match target {
            Some(target) => Ok(self.deliver(vec![target], event).await > 0),
            None => Ok(false),
        }
    }

    async fn deliver(&self, targets: Vec<(String, Arc<dyn Session>)>, event: TaskEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (client_id, session) in targets {
            match session.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "Session send failed, evicting");
                    dead.push(client_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for client_id in dead {
                if let Some(entry) = sessions.remove(&client_id) {
                    entry.session.close();
                }
            }
        }

        delivered
    }

    /// Drop sessions bound to any of the given worker names
    pub async fn drop_worker_sessions(&self, names: &[String]) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, entry| {
            let stale = entry
                .worker
                .as_ref()
                .map(|w| names.contains(&w.name))
                .unwrap_or(false);
            if stale {
                entry.session.close();
            }
            !stale
        });
    }

    /// Background sweep: workers silent past `inactive_duration` are marked
    /// inactive and their sessions dropped.
    pub async fn check_worker_status_loop(
        self: Arc<Self>,
        check_interval: std::time::Duration,
        inactive_duration: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = check_interval.as_secs(),
            inactive_secs = inactive_duration.num_seconds(),
            "Worker inactivity sweep started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Worker inactivity sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let cutoff = utc_now() - inactive_duration;
                    match WorkerRepository::new(self.db.pool()).retire_stale(cutoff).await {
                        Ok(names) if !names.is_empty() => {
                            warn!(workers = ?names, "Workers retired for inactivity");
                            self.drop_worker_sessions(&names).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Inactivity sweep failed"),
                    }
                }
            }
        }
    }
}

/// Routing predicate: empty `worker_select` matches all workers, labels are
/// an AND over equality, and a worker advertising categories only receives
/// tasks it supports.
fn worker_matches(meta: &TaskMeta, category: &str, worker: &RegisteredWorker) -> bool {
    if !worker.meta.tasks.is_empty() && !worker.meta.tasks.iter().any(|c| c == category) {
        return false;
    }
    if !meta.worker_select.is_empty() && !meta.worker_select.iter().any(|n| n == &worker.name) {
        return false;
    }
    meta.worker_labels
        .iter()
        .all(|(k, v)| worker.meta.labels.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelSession;
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

    fn worker(name: &str, tasks: Vec<&str>, labels: Vec<(&str, &str)>) -> RegisteredWorker {
        RegisteredWorker {
            worker_id: format!("id-{}", name),
            name: name.to_string(),
            meta: WorkerMeta {
                tasks: tasks.into_iter().map(String::from).collect(),
                labels: labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    fn task_with_meta(meta: TaskMeta) -> Task {
        let mut task = crate::session::dummy_task("t-route");
        task.meta = meta.to_json().unwrap();
        task
    }

    #[test]
    fn test_worker_matches_selectors() {
        let w = worker("w1", vec!["default"], vec![("zone", "a")]);

        // Empty selectors match everyone supporting the category
        assert!(worker_matches(&TaskMeta::default(), "default", &w));
        // Unsupported category is filtered
        assert!(!worker_matches(&TaskMeta::default(), "gpu", &w));

        let mut select = TaskMeta::default();
        select.worker_select = vec!["w1".to_string()];
        assert!(worker_matches(&select, "default", &w));
        select.worker_select = vec!["w2".to_string()];
        assert!(!worker_matches(&select, "default", &w));

        let mut labels = TaskMeta::default();
        labels.worker_labels.insert("zone".to_string(), "a".to_string());
        assert!(worker_matches(&labels, "default", &w));
        labels.worker_labels.insert("disk".to_string(), "ssd".to_string());
        assert!(!worker_matches(&labels, "default", &w));
    }

    #[tokio::test]
    async fn test_push_run_routes_to_eligible_sessions() {
        let hub = WorkerHub::new(create_test_db().await);

        let (s1, mut rx1) = ChannelSession::new("c1".to_string(), 8);
        let (s2, mut rx2) = ChannelSession::new("c2".to_string(), 8);
        hub.add(Arc::new(s1)).await;
        hub.add(Arc::new(s2)).await;

        hub.register_worker(
            "c1",
            RegisterWorkerData {
                name: "w1".to_string(),
                metadata: WorkerMeta::default(),
            },
        )
        .await
        .unwrap();
        hub.register_worker(
            "c2",
            RegisterWorkerData {
                name: "w2".to_string(),
                metadata: WorkerMeta::default(),
            },
        )
        .await
        .unwrap();

        // No selector: both receive the event
        let task = task_with_meta(TaskMeta::default());
        assert_eq!(hub.push_run(&task).await.unwrap(), 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());

        // Name selector: only w2 receives it
        let mut meta = TaskMeta::default();
        meta.worker_select = vec!["w2".to_string()];
        let task = task_with_meta(meta);
        assert_eq!(hub.push_run(&task).await.unwrap(), 1);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dead_session_is_evicted_on_send() {
        let hub = WorkerHub::new(create_test_db().await);

        let (s1, rx1) = ChannelSession::new("c1".to_string(), 8);
        hub.add(Arc::new(s1)).await;
        hub.register_worker(
            "c1",
            RegisterWorkerData {
                name: "w1".to_string(),
                metadata: WorkerMeta::default(),
            },
        )
        .await
        .unwrap();
        drop(rx1); // peer gone

        let task = task_with_meta(TaskMeta::default());
        assert_eq!(hub.push_run(&task).await.unwrap(), 0);
        assert_eq!(hub.count().await, 0);
    }

    #[tokio::test]
    async fn test_unregistered_session_gets_no_runs() {
        let hub = WorkerHub::new(create_test_db().await);

        let (s1, mut rx1) = ChannelSession::new("c1".to_string(), 8);
        hub.add(Arc::new(s1)).await;

        let task = task_with_meta(TaskMeta::default());
        assert_eq!(hub.push_run(&task).await.unwrap(), 0);

        // Broadcast still reaches it (stop/kill fan-out)
        assert_eq!(hub.broadcast(TaskEvent::stop(task)).await, 1);
        assert!(rx1.recv().await.is_some());
    }
}
