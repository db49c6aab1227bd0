//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles all scheduler settings from environment variables and files

use ch_core::{Error, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub hub: HubConfig,
    #[validate(nested)]
    pub workflow: WorkflowConfig,
    #[validate(nested)]
    pub security: SecurityConfig,
}

/// Listener binds for the process
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    /// Bind address for the worker session listener
    #[validate(length(min = 1))]
    pub worker_bind: String,
    /// Bind address for the observability endpoints
    #[validate(length(min = 1))]
    pub obs_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_bind: "127.0.0.1:7200".to_string(),
            obs_bind: "127.0.0.1:9100".to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
    pub sqlite_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "cronhub.db".to_string(),
            pool_size: 10,
            sqlite_wal: true,
        }
    }
}

/// Dispatch loop intervals and retry backoff knobs
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Dispatch loop tick in seconds
    #[validate(range(min = 1, max = 60))]
    pub dispatch_tick_secs: u64,
    /// Timeout sweep tick in seconds
    #[validate(range(min = 1, max = 60))]
    pub timeout_tick_secs: u64,
    /// Retry sweep tick in seconds
    #[validate(range(min = 1, max = 600))]
    pub retry_tick_secs: u64,
    /// Maximum cronjobs loaded per dispatch tick
    #[validate(range(min = 1, max = 10000))]
    pub dispatch_batch_limit: i64,
    /// Maximum retry candidates loaded per retry tick
    #[validate(range(min = 1, max = 10000))]
    pub retry_batch_limit: i64,
    /// First retry delay in seconds
    #[validate(range(min = 1))]
    pub retry_base_delay_secs: i64,
    /// Backoff multiplier applied per attempt
    #[validate(range(min = 1.0, max = 16.0))]
    pub retry_multiplier: f64,
    /// Backoff ceiling in seconds
    #[validate(range(min = 1))]
    pub retry_max_delay_secs: i64,
    /// A failed task older than this no longer retries (seconds)
    #[validate(range(min = 60))]
    pub retry_grace_secs: i64,
    /// Leader lock lease in seconds for each loop
    #[validate(range(min = 5, max = 3600))]
    pub leader_lease_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_tick_secs: 1,
            timeout_tick_secs: 1,
            retry_tick_secs: 30,
            dispatch_batch_limit: 200,
            retry_batch_limit: 100,
            retry_base_delay_secs: 60,
            retry_multiplier: 2.0,
            retry_max_delay_secs: 3600,
            retry_grace_secs: 1800,
            leader_lease_secs: 30,
        }
    }
}

/// Worker hub configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HubConfig {
    /// A worker silent for longer than this is marked inactive (seconds)
    #[validate(range(min = 5))]
    pub inactive_secs: i64,
    /// Inactivity sweep interval in seconds
    #[validate(range(min = 1))]
    pub sweep_tick_secs: u64,
    /// Grace window before a stop escalates to kill (seconds)
    #[validate(range(min = 1, max = 300))]
    pub stop_ack_grace_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inactive_secs: 60,
            sweep_tick_secs: 15,
            stop_ack_grace_secs: 10,
        }
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct WorkflowConfig {
    /// Default timeout for a whole workflow execute (seconds)
    #[validate(range(min = 60))]
    pub default_timeout_secs: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 86_400, // 24 hours
        }
    }
}

/// Security configuration with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct SecurityConfig {
    /// Pepper mixed into webhook token digests
    #[validate(length(min = 16))]
    pub webhook_pepper: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        // Generate a process-unique pepper by default; deployments override it
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        Self {
            webhook_pepper: format!("INSECURE-RANDOM-{}-CHANGE-IN-PRODUCTION", timestamp),
        }
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("webhook_pepper", &"[REDACTED]")
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional .env file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Set defaults first
        builder = builder
            .set_default("server.worker_bind", "127.0.0.1:7200")?
            .set_default("server.obs_bind", "127.0.0.1:9100")?
            .set_default("database.path", "cronhub.db")?
            .set_default("database.pool_size", 10)?
            .set_default("database.sqlite_wal", true)?
            .set_default("scheduler.dispatch_tick_secs", 1)?
            .set_default("scheduler.timeout_tick_secs", 1)?
            .set_default("scheduler.retry_tick_secs", 30)?
            .set_default("scheduler.dispatch_batch_limit", 200)?
            .set_default("scheduler.retry_batch_limit", 100)?
            .set_default("scheduler.retry_base_delay_secs", 60)?
            .set_default("scheduler.retry_multiplier", 2.0)?
            .set_default("scheduler.retry_max_delay_secs", 3600)?
            .set_default("scheduler.retry_grace_secs", 1800)?
            .set_default("scheduler.leader_lease_secs", 30)?
            .set_default("hub.inactive_secs", 60)?
            .set_default("hub.sweep_tick_secs", 15)?
            .set_default("hub.stop_ack_grace_secs", 10)?
            .set_default("workflow.default_timeout_secs", 86_400)?;

        // Handle nested environment variables that don't work with the
        // standard separator
        if let Ok(pepper) = std::env::var("CRONHUB_SECURITY_WEBHOOK_PEPPER") {
            builder = builder.set_override("security.webhook_pepper", pepper)?;
        } else {
            let default_pepper = format!(
                "INSECURE-RANDOM-{}-CHANGE-IN-PRODUCTION",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos()
            );
            builder = builder.set_default("security.webhook_pepper", default_pepper)?;
        }

        if let Ok(pool_size) = std::env::var("CRONHUB_DATABASE_POOL_SIZE") {
            builder = builder.set_override("database.pool_size", pool_size)?;
        }

        if let Ok(bind) = std::env::var("CRONHUB_SERVER_WORKER_BIND") {
            builder = builder.set_override("server.worker_bind", bind)?;
        }

        if let Ok(bind) = std::env::var("CRONHUB_SERVER_OBS_BIND") {
            builder = builder.set_override("server.obs_bind", bind)?;
        }

        // Try to load from .env file if it exists (optional)
        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        // Load from environment variables with CRONHUB_ prefix (highest priority)
        builder = builder.add_source(
            Environment::with_prefix("CRONHUB")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Use a mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let vars_to_clear = [
            "CRONHUB_DATABASE_PATH",
            "CRONHUB_DATABASE_POOL_SIZE",
            "CRONHUB_SERVER_WORKER_BIND",
            "CRONHUB_SERVER_OBS_BIND",
            "CRONHUB_SECURITY_WEBHOOK_PEPPER",
        ];
        let original_values: Vec<_> = vars_to_clear.iter().map(|key| env::var(key).ok()).collect();
        for key in &vars_to_clear {
            env::remove_var(key);
        }

        let config = Config::load().expect("Should load with defaults");

        assert_eq!(config.database.path, "cronhub.db");
        assert_eq!(config.database.pool_size, 10);
        assert!(config.database.sqlite_wal);
        assert_eq!(config.scheduler.dispatch_tick_secs, 1);
        assert_eq!(config.scheduler.retry_base_delay_secs, 60);
        assert_eq!(config.scheduler.retry_max_delay_secs, 3600);
        assert_eq!(config.hub.inactive_secs, 60);
        assert_eq!(config.workflow.default_timeout_secs, 86_400);

        for (key, value) in vars_to_clear.iter().zip(original_values.iter()) {
            if let Some(val) = value {
                env::set_var(key, val);
            }
        }
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();

        env::remove_var("CRONHUB_DATABASE_POOL_SIZE");
        env::set_var("CRONHUB_SERVER_WORKER_BIND", "0.0.0.0:7300");
        env::set_var(
            "CRONHUB_SECURITY_WEBHOOK_PEPPER",
            "valid16charpepperfortesting",
        );

        let config = Config::load().expect("Should load from env");
        assert_eq!(config.server.worker_bind, "0.0.0.0:7300");

        env::remove_var("CRONHUB_SERVER_WORKER_BIND");
        env::remove_var("CRONHUB_SECURITY_WEBHOOK_PEPPER");
    }

    #[test]
    fn test_config_validation_failure() {
        let _lock = ENV_MUTEX.lock().unwrap();

        env::set_var("CRONHUB_DATABASE_POOL_SIZE", "200"); // Too big

        let result = Config::load();
        assert!(result.is_err());

        env::remove_var("CRONHUB_DATABASE_POOL_SIZE");
    }

    #[test]
    fn test_secret_redaction() {
        let _lock = ENV_MUTEX.lock().unwrap();

        env::remove_var("CRONHUB_SECURITY_WEBHOOK_PEPPER");

        let config = Config::load().expect("Should load with defaults");
        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("INSECURE-RANDOM"));
    }
}
