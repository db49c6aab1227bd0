//! ABOUTME: Workflow repository - step templates and aggregate statistics
//! ABOUTME: Steps are stored as a JSON column and validated at authoring time

use ch_core::{now_rfc3339, Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::info;

use crate::map_write_err;

/// How a batch of parallel steps gates the next batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Every member must reach a terminal status
    All,
    /// One success unblocks the next batch
    Any,
    /// N successes unblock the next batch
    Threshold(u32),
}

impl WaitStrategy {
    pub fn as_string(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Any => "any".to_string(),
            Self::Threshold(n) => format!("threshold:{}", n),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            other => {
                if let Some(n) = other.strip_prefix("threshold:") {
                    let n: u32 = n.parse().map_err(|_| {
                        Error::BadRequest(format!("Invalid wait strategy: {}", other))
                    })?;
                    if n == 0 {
                        return Err(Error::BadRequest(
                            "threshold wait strategy requires N >= 1".to_string(),
                        ));
                    }
                    Ok(Self::Threshold(n))
                } else {
                    Err(Error::BadRequest(format!("Invalid wait strategy: {}", other)))
                }
            }
        }
    }
}

impl Serialize for WaitStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for WaitStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::All
    }
}

/// What a member failure does to its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    #[default]
    Continue,
    Abort,
}

/// One node of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    pub order: i64,
    pub name: String,
    pub category: String,
    pub command: String,
    /// May reference `${var}` placeholders
    pub args: String,
    pub timeout_secs: i64,
    /// Empty condition = always run
    pub condition: String,
    /// Empty string = a singleton batch
    pub parallel_group: String,
    pub wait_strategy: WaitStrategy,
    pub failure_strategy: FailureStrategy,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            order: 1,
            name: String::new(),
            category: "default".to_string(),
            command: String::new(),
            args: String::new(),
            timeout_secs: 0,
            condition: String::new(),
            parallel_group: String::new(),
            wait_strategy: WaitStrategy::All,
            failure_strategy: FailureStrategy::Continue,
        }
    }
}

/// Workflow entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub description: String,
    pub steps: String,             // JSON Vec<Step>
    pub default_variables: String, // JSON object
    pub webhook_token_digest: Option<String>,
    pub webhook_allow_cidrs: String, // JSON Vec<String>
    pub is_active: bool,
    pub execute_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub last_execute_at: Option<String>,
    pub last_status: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Workflow {
    pub fn parse_steps(&self) -> Result<Vec<Step>> {
        serde_json::from_str(&self.steps)
            .map_err(|e| Error::BadRequest(format!("Invalid workflow steps: {}", e)))
    }

    pub fn parse_default_variables(&self) -> Result<HashMap<String, serde_json::Value>> {
        if self.default_variables.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&self.default_variables)
            .map_err(|e| Error::BadRequest(format!("Invalid workflow variables: {}", e)))
    }

    pub fn parse_allow_cidrs(&self) -> Result<Vec<String>> {
        if self.webhook_allow_cidrs.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.webhook_allow_cidrs)
            .map_err(|e| Error::BadRequest(format!("Invalid webhook allow list: {}", e)))
    }
}

/// Request to create a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub team_id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<Step>,
    pub default_variables: HashMap<String, serde_json::Value>,
    pub webhook_token_digest: Option<String>,
    pub webhook_allow_cidrs: Vec<String>,
    pub is_active: bool,
}

/// Structural validation of a step list: unique ascending orders starting
/// at 1, non-empty commands, coherent thresholds. No cycles are possible by
/// construction since references are step orders in a flat list.
pub fn validate_steps(steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        return Err(Error::BadRequest("Workflow needs at least one step".to_string()));
    }
    let mut last_order = 0;
    for step in steps {
        if step.order < 1 {
            return Err(Error::BadRequest(format!(
                "Step '{}' has order {}; orders start at 1",
                step.name, step.order
            )));
        }
        if step.order <= last_order {
            return Err(Error::BadRequest(format!(
                "Step '{}' order {} is not strictly increasing",
                step.name, step.order
            )));
        }
        last_order = step.order;
        if step.command.is_empty() {
            return Err(Error::BadRequest(format!(
                "Step '{}' has an empty command",
                step.name
            )));
        }
    }

    // A threshold can never exceed the size of its batch
    let mut i = 0;
    while i < steps.len() {
        let group = &steps[i].parallel_group;
        let batch_len = if group.is_empty() {
            1
        } else {
            steps[i..]
                .iter()
                .take_while(|s| s.parallel_group == *group)
                .count()
        };
        if let WaitStrategy::Threshold(n) = steps[i].wait_strategy {
            if n as usize > batch_len {
                return Err(Error::BadRequest(format!(
                    "Step '{}' threshold {} exceeds batch size {}",
                    steps[i].name, n, batch_len
                )));
            }
        }
        i += batch_len;
    }
    Ok(())
}

/// Workflow repository
pub struct WorkflowRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkflowRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new workflow template
    pub async fn create(&self, request: CreateWorkflowRequest) -> Result<Workflow> {
        validate_steps(&request.steps)?;

        let id = Id::new().to_string();
        let now = now_rfc3339();
        let steps = serde_json::to_string(&request.steps)
            .map_err(|e| Error::BadRequest(format!("Invalid workflow steps: {}", e)))?;
        let variables = serde_json::to_string(&request.default_variables)
            .map_err(|e| Error::BadRequest(format!("Invalid workflow variables: {}", e)))?;
        let cidrs = serde_json::to_string(&request.webhook_allow_cidrs)
            .map_err(|e| Error::BadRequest(format!("Invalid webhook allow list: {}", e)))?;

        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            INSERT INTO workflows (
                id, team_id, name, description, steps, default_variables,
                webhook_token_digest, webhook_allow_cidrs, is_active,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&request.team_id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&steps)
        .bind(&variables)
        .bind(&request.webhook_token_digest)
        .bind(&cidrs)
        .bind(request.is_active)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool)
        .await
        .map_err(|e| map_write_err("workflow", e))?;

        info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow created");
        Ok(workflow)
    }

    /// Find workflow by ID
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Workflow>> {
        sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find workflow: {}", e)))
    }

    /// Tenant-checked fetch
    pub async fn get(&self, team_id: &str, id: &str) -> Result<Workflow> {
        let workflow = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {} not found", id)))?;
        if workflow.team_id != team_id {
            return Err(Error::Forbidden(format!(
                "Workflow {} does not belong to team {}",
                id, team_id
            )));
        }
        Ok(workflow)
    }

    /// Flip a workflow in or out of rotation
    pub async fn set_active(&self, team_id: &str, id: &str, is_active: bool) -> Result<()> {
        self.get(team_id, id).await?;
        sqlx::query("UPDATE workflows SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(now_rfc3339())
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to toggle workflow: {}", e)))?;
        Ok(())
    }

    /// Soft delete
    pub async fn delete(&self, team_id: &str, id: &str) -> Result<()> {
        self.get(team_id, id).await?;
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE workflows SET is_deleted = 1, deleted_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to delete workflow: {}", e)))?;
        Ok(())
    }

    /// Count an execute at start time; success/failed are counted once at
    /// completion so the totals never double-count.
    pub async fn record_execute_started(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            r#"
            UPDATE workflows
            SET execute_count = execute_count + 1, last_execute_at = ?,
                last_status = 'pending', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record workflow start: {}", e)))?;
        Ok(())
    }

    /// Mirror a finished execute's outcome onto the template
    pub async fn record_execute_finished(&self, id: &str, status: &str) -> Result<()> {
        let now = now_rfc3339();
        let (success_inc, failed_inc) = match status {
            "success" => (1, 0),
            "failed" => (0, 1),
            _ => (0, 0),
        };
        sqlx::query(
            r#"
            UPDATE workflows
            SET success_count = success_count + ?, failed_count = failed_count + ?,
                last_status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(success_inc)
        .bind(failed_inc)
        .bind(status)
        .bind(&now)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record workflow finish: {}", e)))?;
        Ok(())
    }

    /// Tenant listing
    pub async fn list_for_team(&self, team_id: &str, limit: i64) -> Result<Vec<Workflow>> {
        sqlx::query_as::<_, Workflow>(
            r#"
            SELECT * FROM workflows
            WHERE team_id = ? AND is_deleted = 0
            ORDER BY created_at DESC LIMIT ?
            "#,
        )
        .bind(team_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list workflows: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;
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

    fn step(order: i64, name: &str) -> Step {
        Step {
            order,
            name: name.to_string(),
            command: format!("{}.sh", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_wait_strategy_parse() {
        assert_eq!(WaitStrategy::parse("all").unwrap(), WaitStrategy::All);
        assert_eq!(WaitStrategy::parse("").unwrap(), WaitStrategy::All);
        assert_eq!(WaitStrategy::parse("any").unwrap(), WaitStrategy::Any);
        assert_eq!(
            WaitStrategy::parse("threshold:3").unwrap(),
            WaitStrategy::Threshold(3)
        );
        assert!(WaitStrategy::parse("threshold:0").is_err());
        assert!(WaitStrategy::parse("most").is_err());

        let s = WaitStrategy::Threshold(2).as_string();
        assert_eq!(WaitStrategy::parse(&s).unwrap(), WaitStrategy::Threshold(2));
    }

    #[test]
    fn test_validate_steps() {
        assert!(validate_steps(&[]).is_err());
        assert!(validate_steps(&[step(1, "a"), step(2, "b")]).is_ok());

        // Duplicate order
        assert!(validate_steps(&[step(1, "a"), step(1, "b")]).is_err());
        // Order below 1
        assert!(validate_steps(&[step(0, "a")]).is_err());
        // Empty command
        let mut bad = step(1, "a");
        bad.command = String::new();
        assert!(validate_steps(&[bad]).is_err());

        // Threshold larger than its batch
        let mut p1 = step(1, "a");
        p1.parallel_group = "g1".to_string();
        p1.wait_strategy = WaitStrategy::Threshold(3);
        let mut p2 = step(2, "b");
        p2.parallel_group = "g1".to_string();
        assert!(validate_steps(&[p1.clone(), p2.clone()]).is_err());

        p1.wait_strategy = WaitStrategy::Threshold(2);
        assert!(validate_steps(&[p1, p2]).is_ok());
    }

    #[tokio::test]
    async fn test_create_and_stats_mirror() {
        let db = create_test_db().await;
        let repo = WorkflowRepository::new(db.pool());

        let wf = repo
            .create(CreateWorkflowRequest {
                team_id: "team-1".to_string(),
                name: "deploy".to_string(),
                description: String::new(),
                steps: vec![step(1, "build"), step(2, "release")],
                default_variables: HashMap::new(),
                webhook_token_digest: None,
                webhook_allow_cidrs: Vec::new(),
                is_active: true,
            })
            .await
            .unwrap();

        assert_eq!(wf.execute_count, 0);
        assert_eq!(wf.parse_steps().unwrap().len(), 2);

        repo.record_execute_started(&wf.id).await.unwrap();
        repo.record_execute_started(&wf.id).await.unwrap();
        repo.record_execute_finished(&wf.id, "success").await.unwrap();
        repo.record_execute_finished(&wf.id, "failed").await.unwrap();

        let wf = repo.find_by_id(&wf.id).await.unwrap().unwrap();
        assert_eq!(wf.execute_count, 2);
        assert_eq!(wf.success_count, 1);
        assert_eq!(wf.failed_count, 1);
        assert_eq!(wf.last_status.as_deref(), Some("failed"));

        assert_eq!(repo.list_for_team("team-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_active_and_delete() {
        let db = create_test_db().await;
        let repo = WorkflowRepository::new(db.pool());

        let wf = repo
            .create(CreateWorkflowRequest {
                team_id: "team-1".to_string(),
                name: "toggle".to_string(),
                description: String::new(),
                steps: vec![step(1, "only")],
                default_variables: HashMap::new(),
                webhook_token_digest: None,
                webhook_allow_cidrs: Vec::new(),
                is_active: true,
            })
            .await
            .unwrap();

        repo.set_active("team-1", &wf.id, false).await.unwrap();
        assert!(!repo.find_by_id(&wf.id).await.unwrap().unwrap().is_active);

        // Tenant mismatch refused before any write
        assert!(repo.set_active("team-2", &wf.id, true).await.is_err());

        repo.delete("team-1", &wf.id).await.unwrap();
        assert!(repo.find_by_id(&wf.id).await.unwrap().is_none());

        // The name frees up for reuse after the soft delete
        repo.create(CreateWorkflowRequest {
            team_id: "team-1".to_string(),
            name: "toggle".to_string(),
            description: String::new(),
            steps: vec![step(1, "only")],
            default_variables: HashMap::new(),
            webhook_token_digest: None,
            webhook_allow_cidrs: Vec::new(),
            is_active: true,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_steps_json_roundtrip() {
        let db = create_test_db().await;
        let repo = WorkflowRepository::new(db.pool());

        let mut fanout = step(2, "shard-a");
        fanout.parallel_group = "g1".to_string();
        fanout.wait_strategy = WaitStrategy::Threshold(1);
        fanout.failure_strategy = FailureStrategy::Abort;
        fanout.condition = "task_status == success".to_string();
        fanout.args = "--input ${dataset}".to_string();

        let wf = repo
            .create(CreateWorkflowRequest {
                team_id: "team-1".to_string(),
                name: "shards".to_string(),
                description: String::new(),
                steps: vec![step(1, "prepare"), fanout],
                default_variables: HashMap::from([(
                    "dataset".to_string(),
                    serde_json::json!("main"),
                )]),
                webhook_token_digest: None,
                webhook_allow_cidrs: vec!["10.0.0.0/8".to_string()],
                is_active: true,
            })
            .await
            .unwrap();

        let steps = wf.parse_steps().unwrap();
        assert_eq!(steps[1].wait_strategy, WaitStrategy::Threshold(1));
        assert_eq!(steps[1].failure_strategy, FailureStrategy::Abort);
        assert_eq!(steps[1].args, "--input ${dataset}");
        assert_eq!(wf.parse_allow_cidrs().unwrap(), vec!["10.0.0.0/8"]);
        assert_eq!(
            wf.parse_default_variables().unwrap().get("dataset"),
            Some(&serde_json::json!("main"))
        );
    }
}
