//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common test fixtures and mocks for all crates

use ch_db::{Db, Task, TaskMeta};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Simple test helper function to demonstrate cross-crate testing
pub fn create_test_id() -> String {
    "test-id-123".to_string()
}

/// Helper for creating temporary directories in tests
pub fn temp_dir_path() -> std::path::PathBuf {
    std::env::temp_dir().join("cronhub-test")
}

/// In-memory SQLite database with all migrations applied.
///
/// A single-connection pool keeps the `:memory:` database alive and shared
/// between repositories.
pub async fn in_memory_db() -> Db {
    let options =
        SqliteConnectOptions::from_str("sqlite::memory:").expect("static options are valid");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to open in-memory database");
    let db = Db::attach(pool);
    db.migrate().await.expect("Failed to run migrations");
    db
}

/// A plain pending task struct, not persisted anywhere
pub fn task_fixture() -> Task {
    Task {
        id: "task-fixture".to_string(),
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
        meta: TaskMeta::default().to_json().expect("default meta serialises"),
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
