//! ABOUTME: Wire envelopes exchanged with workers
//! ABOUTME: TaskEvent flows outbound, ClientEvent flows inbound

use ch_db::{Task, WorkerMeta};
use serde::{Deserialize, Serialize};

/// Outbound actions the scheduler pushes to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Run,
    Stop,
    Kill,
    Timeout,
    Retry,
}

/// Outbound event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub action: EventAction,
    pub tasks: Vec<Task>,
}

impl TaskEvent {
    pub fn new(action: EventAction, task: Task) -> Self {
        Self {
            action,
            tasks: vec![task],
        }
    }

    pub fn run(task: Task) -> Self {
        Self::new(EventAction::Run, task)
    }

    pub fn stop(task: Task) -> Self {
        Self::new(EventAction::Stop, task)
    }

    pub fn kill(task: Task) -> Self {
        Self::new(EventAction::Kill, task)
    }

    pub fn timeout(task: Task) -> Self {
        Self::new(EventAction::Timeout, task)
    }
}

/// Inbound actions reported by workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAction {
    Ping,
    TaskUpdate,
    RegistWorker,
}

/// Inbound event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    pub action: ClientAction,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of a `regist_worker` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerData {
    pub name: String,
    #[serde(default)]
    pub metadata: WorkerMeta,
}

/// Payload of a `task_update` event: partial task fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskUpdateData {
    pub status: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub output: Option<String>,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub failure_reason: Option<String>,
}
