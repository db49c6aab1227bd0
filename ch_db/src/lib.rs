//! ABOUTME: Database layer with SQLite, migrations, and repositories
//! ABOUTME: Handles all data persistence and database operations

use ch_core::{Error, Result};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Embedded migrations, applied on every open
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connection settings for the scheduler store
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub path: String,
    pub max_connections: u32,
    /// How long a writer waits on a locked database file
    pub busy_timeout: Duration,
    /// Bring-up attempts before the process gives up
    pub startup_attempts: u32,
}

impl DbOptions {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            max_connections: 10,
            busy_timeout: Duration::from_secs(30),
            startup_attempts: 5,
        }
    }
}

/// Database handle shared by every repository
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open with default options
    pub async fn new(path: &str) -> Result<Self> {
        Self::open(&DbOptions::new(path)).await
    }

    /// Open the store. Bring-up failures (locked file, slow volume mount)
    /// are retried on a doubling schedule; the subsecond stagger keeps
    /// replicas that restarted together from retrying in lockstep.
    #[instrument(skip(options), fields(path = %options.path))]
    pub async fn open(options: &DbOptions) -> Result<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect_and_migrate(options).await {
                Ok(db) => {
                    info!(attempt, "Database ready");
                    return Ok(db);
                }
                Err(e) if attempt < options.startup_attempts => {
                    let delay = startup_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Database bring-up failed, waiting"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Database(format!(
                        "Database unavailable after {} attempts: {}",
                        attempt, e
                    )));
                }
            }
        }
    }

    async fn connect_and_migrate(options: &DbOptions) -> Result<Self> {
        // WAL plus relaxed sync suits the write-heavy scheduler loops
        let connect = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(options.busy_timeout)
            .pragma("temp_store", "memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .connect_with(connect)
            .await
            .map_err(|e| Error::Database(format!("Failed to open {}: {}", options.path, e)))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
        debug!("Migrations up to date");
        Ok(())
    }

    /// Wrap an existing pool (tests and shared fixtures)
    pub fn attach(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe backing the readiness gate
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Store unreachable: {}", e)))?;
        Ok(())
    }
}

/// Delay before retrying bring-up attempt `attempt` (1-based): doubling,
/// capped, plus up to 300ms of clock-derived stagger.
fn startup_delay(attempt: u32) -> Duration {
    let base_ms = (500u64 << attempt.min(5)).min(16_000);
    let stagger_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_millis() as u64
        % 300;
    Duration::from_millis(base_ms + stagger_ms)
}

/// Map a sqlx write error, surfacing unique-constraint hits as conflicts
pub(crate) fn map_write_err(entity: &str, e: sqlx::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        Error::Conflict(format!("{} already exists", entity))
    } else {
        Error::Database(format!("Failed to write {}: {}", entity, msg))
    }
}

// Repository modules
pub mod repositories;

pub use repositories::{
    cronjobs::{CreateCronJobRequest, CronJob, CronJobRepository, UpdateCronJobRequest},
    task_logs::{TaskLogEntry, TaskLogRepository},
    tasks::{
        CreateTaskRequest, RetryBackoff, Task, TaskMeta, TaskPatch, TaskRepository, TaskStatus,
    },
    workers::{RegisterWorkerRequest, Worker, WorkerMeta, WorkerRepository},
    workflow_executes::{
        ProgressUpdate, WorkflowExecute, WorkflowExecuteRepository, WorkflowExecuteStatus,
    },
    workflows::{
        CreateWorkflowRequest, FailureStrategy, Step, WaitStrategy, Workflow, WorkflowRepository,
    },
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// In-memory database with migrations applied
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

    #[tokio::test]
    async fn test_ping_after_migrate() {
        let db = create_test_db().await;
        db.ping().await.expect("Store should answer");
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let db = create_test_db().await;
        db.migrate().await.expect("Second migrate run should be a no-op");
    }

    #[test]
    fn test_startup_delay_schedule() {
        // Doubling up to the cap, never below the base
        let first = startup_delay(1);
        assert!(first >= Duration::from_millis(1000));
        assert!(first < Duration::from_millis(1300));

        for attempt in [1, 5, 9, 30] {
            let d = startup_delay(attempt);
            // 16s cap plus at most 300ms stagger
            assert!(d <= Duration::from_millis(16_300), "attempt {}", attempt);
        }
    }

    #[test]
    fn test_options_defaults() {
        let options = DbOptions::new("scheduler.db");
        assert_eq!(options.path, "scheduler.db");
        assert_eq!(options.max_connections, 10);
        assert_eq!(options.startup_attempts, 5);
    }
}
