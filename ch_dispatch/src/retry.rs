//! ABOUTME: Retry policy - failure classification, eligibility, backoff
//! ABOUTME: timeout status never retries; the next cron period covers it

use ch_core::{parse_rfc3339, utc_now, Result};
use ch_db::{RetryBackoff, Task, TaskStatus};
use chrono::{DateTime, Duration, Utc};

/// Failure reason taxonomy recorded on failed tasks
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_WORKER_ERROR: &str = "worker_error";
pub const REASON_NETWORK: &str = "network_error";
pub const REASON_PERMISSION: &str = "permission";
pub const REASON_BAD_COMMAND: &str = "bad_command";
pub const REASON_RESOURCE: &str = "resource_error";
pub const REASON_INVALID_ARGS: &str = "invalid_args";
pub const REASON_DEPENDENCY: &str = "dependency_error";
pub const REASON_UNKNOWN: &str = "unknown";

/// Retry policy: classification plus eligibility windows
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: RetryBackoff,
    /// A task whose deadline passed longer ago than this never retries
    pub grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: RetryBackoff::default(),
            grace: Duration::minutes(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: RetryBackoff, grace: Duration) -> Self {
        Self { backoff, grace }
    }

    /// Map an error message onto the failure taxonomy by case-insensitive
    /// substring. Specific classes are probed before the generic ones.
    pub fn classify(err: &str) -> &'static str {
        let err = err.to_lowercase();

        if err.contains("timeout") || err.contains("timed out") || err.contains("deadline") {
            return REASON_TIMEOUT;
        }
        if err.contains("connection")
            || err.contains("network")
            || err.contains("unreachable")
            || err.contains("broken pipe")
            || err.contains("reset by peer")
            || err.contains("refused")
        {
            return REASON_NETWORK;
        }
        if err.contains("permission") || err.contains("access denied") || err.contains("forbidden")
        {
            return REASON_PERMISSION;
        }
        if err.contains("command not found")
            || err.contains("no such file")
            || err.contains("executable")
        {
            return REASON_BAD_COMMAND;
        }
        if err.contains("out of memory")
            || err.contains("no space")
            || err.contains("disk full")
            || err.contains("resource")
        {
            return REASON_RESOURCE;
        }
        if err.contains("invalid argument")
            || err.contains("invalid args")
            || err.contains("usage:")
        {
            return REASON_INVALID_ARGS;
        }
        if err.contains("dependency") || err.contains("missing module") || err.contains("library")
        {
            return REASON_DEPENDENCY;
        }
        REASON_UNKNOWN
    }

    /// Reasons that point at the environment rather than the job itself
    pub fn is_retryable_reason(reason: &str) -> bool {
        matches!(
            reason,
            REASON_TIMEOUT
                | REASON_WORKER_ERROR
                | REASON_NETWORK
                | REASON_RESOURCE
                | REASON_DEPENDENCY
        )
    }

    /// Retry eligibility. A task in `timeout` status is not retried - the
    /// next cron period schedules a fresh task instead. When a deadline was
    /// set, a failure older than the grace window no longer retries.
    pub fn should_retry(&self, task: &Task) -> Result<bool> {
        if !task.retryable || task.retry_count >= task.max_retry {
            return Ok(false);
        }
        let status = task.status()?;
        if !matches!(status, TaskStatus::Failed | TaskStatus::Error) {
            return Ok(false);
        }
        if let Some(timeout_at) = &task.timeout_at {
            let timeout_at = parse_rfc3339(timeout_at)?;
            if utc_now() - timeout_at > self.grace {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Eligible and due: the scheduled retry instant has arrived
    pub fn is_retry_ready(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        if !self.should_retry(task)? {
            return Ok(false);
        }
        match &task.next_retry_time {
            Some(t) => Ok(now >= parse_rfc3339(t)?),
            None => Ok(false),
        }
    }

    /// Absolute next-retry instant after attempt `retry_count`
    pub fn next_retry_time(&self, retry_count: i64, failure_time: DateTime<Utc>) -> DateTime<Utc> {
        self.backoff.next_retry_time(retry_count, failure_time)
    }
}
