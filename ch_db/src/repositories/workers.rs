//! ABOUTME: Worker repository - remote execution nodes and their liveness
//! ABOUTME: Registration upserts by name; a sweeper retires silent workers

use ch_core::{now_rfc3339, to_rfc3339, Error, Id, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::map_write_err;

/// Worker capability advertisement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerMeta {
    /// Task categories this worker accepts
    pub tasks: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl WorkerMeta {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::BadRequest(format!("Invalid worker metadata: {}", e)))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(s)
            .map_err(|e| Error::BadRequest(format!("Invalid worker metadata: {}", e)))
    }
}

/// Worker entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub client_id: Option<String>,
    pub meta: String, // JSON WorkerMeta
    pub is_active: bool,
    pub last_active: String,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Worker {
    pub fn parse_meta(&self) -> Result<WorkerMeta> {
        WorkerMeta::from_json(&self.meta)
    }
}

/// Registration payload from a `regist_worker` client event
#[derive(Debug, Clone)]
pub struct RegisterWorkerRequest {
    pub name: String,
    pub client_id: String,
    pub meta: WorkerMeta,
}

/// Worker repository
pub struct WorkerRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkerRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a worker by name on registration; reconnecting workers keep
    /// their id and get a fresh client binding.
    pub async fn register(&self, request: RegisterWorkerRequest) -> Result<Worker> {
        let now = now_rfc3339();
        let meta = request.meta.to_json()?;

        let existing = self.find_by_name(&request.name).await?;
        let worker = match existing {
            Some(worker) => {
                sqlx::query(
                    r#"
                    UPDATE workers
                    SET client_id = ?, meta = ?, is_active = 1, last_active = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&request.client_id)
                .bind(&meta)
                .bind(&now)
                .bind(&now)
                .bind(&worker.id)
                .execute(self.pool)
                .await
                .map_err(|e| map_write_err("worker", e))?;

                self.find_by_name(&request.name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("Worker {} vanished", request.name)))?
            }
            None => {
                let id = Id::new().to_string();
                sqlx::query_as::<_, Worker>(
                    r#"
                    INSERT INTO workers (
                        id, name, client_id, meta, is_active, last_active,
                        created_at, updated_at
                    ) VALUES (?, ?, ?, ?, 1, ?, ?, ?)
                    RETURNING *
                    "#,
                )
                .bind(&id)
                .bind(&request.name)
                .bind(&request.client_id)
                .bind(&meta)
                .bind(&now)
                .bind(&now)
                .bind(&now)
                .fetch_one(self.pool)
                .await
                .map_err(|e| map_write_err("worker", e))?
            }
        };

        info!(worker = %worker.name, client_id = %request.client_id, "Worker registered");
        Ok(worker)
    }

    /// Find worker by name
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Worker>> {
        sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE name = ? AND is_deleted = 0")
            .bind(name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find worker: {}", e)))
    }

    /// Find worker by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Worker>> {
        sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find worker: {}", e)))
    }

    /// Refresh liveness on ping
    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET last_active = ?, is_active = 1, updated_at = ? WHERE id = ?",
        )
        .bind(to_rfc3339(now))
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to touch worker: {}", e)))?;
        Ok(())
    }

    /// All currently active workers
    pub async fn list_active(&self) -> Result<Vec<Worker>> {
        sqlx::query_as::<_, Worker>(
            "SELECT * FROM workers WHERE is_active = 1 AND is_deleted = 0 ORDER BY name",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list workers: {}", e)))
    }

    /// Mark workers silent past the cutoff as inactive; returns their names
    pub async fn retire_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let stale = sqlx::query_as::<_, Worker>(
            r#"
            SELECT * FROM workers
            WHERE is_active = 1 AND last_active < ? AND is_deleted = 0
            "#,
        )
        .bind(to_rfc3339(cutoff))
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load stale workers: {}", e)))?;

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_rfc3339();
        for worker in &stale {
            sqlx::query("UPDATE workers SET is_active = 0, updated_at = ? WHERE id = ?")
                .bind(&now)
                .bind(&worker.id)
                .execute(self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to retire worker: {}", e)))?;
            debug!(worker = %worker.name, "Worker retired for inactivity");
        }

        Ok(stale.into_iter().map(|w| w.name).collect())
    }
}
