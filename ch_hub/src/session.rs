//! ABOUTME: Worker session abstraction over any bidirectional transport
//! ABOUTME: ChannelSession is the mpsc-backed implementation used everywhere

use async_trait::async_trait;
use ch_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::events::TaskEvent;

/// One live worker connection
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable per-connection id
    fn id(&self) -> &str;

    /// Queue an outbound event; fails if the peer is gone
    async fn send(&self, event: TaskEvent) -> Result<()>;

    /// Tear the session down; subsequent sends fail
    fn close(&self);
}

/// Session over a tokio mpsc channel. The transport end (TCP writer, test
/// harness) drains the receiver; outbound events preserve issue order.
pub struct ChannelSession {
    id: String,
    tx: mpsc::Sender<TaskEvent>,
    closed: Arc<AtomicBool>,
}

impl ChannelSession {
    /// Create a session with a bounded outbound queue
    pub fn new(id: String, capacity: usize) -> (Self, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                id,
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }
}

#[async_trait]
impl Session for ChannelSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, event: TaskEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WorkerUnreachable(format!(
                "Session {} is closed",
                self.id
            )));
        }
        self.tx.send(event).await.map_err(|_| {
            Error::WorkerUnreachable(format!("Session {} receiver dropped", self.id))
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Minimal pending task for hub-level tests
#[cfg(test)]
pub(crate) fn dummy_task(id: &str) -> ch_db::Task {
    use ch_db::{Task, TaskMeta};
    Task {
        id: id.to_string(),
        team_id: "team-1".to_string(),
        cronjob_id: None,
        workflow_exec_id: None,
        step_order: None,
        prev_id: None,
        next_id: None,
        is_group: false,
        category: "default".to_string(),
        command: "true".to_string(),
        args: "{}".to_string(),
        description: String::new(),
        meta: TaskMeta::default().to_json().unwrap(),
        status: "pending".to_string(),
        output: None,
        failure_reason: None,
        worker_id: None,
        worker_name: None,
        save_log: false,
        time_plan: "2025-01-01T00:00:00Z".to_string(),
        timeout_at: None,
        time_start: None,
        time_end: None,
        retry_count: 0,
        max_retry: 0,
        retryable: false,
        is_retry: false,
        next_retry_time: None,
        is_deleted: false,
        deleted_at: None,
        created_at: "2025-01-01T00:00:00Z".to_string(),
        updated_at: "2025-01-01T00:00:00Z".to_string(),
    }
}
