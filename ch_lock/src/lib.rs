//! ABOUTME: Distributed locking mechanism for scheduler coordination
//! ABOUTME: Keyed leased locks with owner tokens, refresh and auto-refresh

use ch_core::{now_rfc3339, parse_rfc3339, to_rfc3339, utc_now, Error, Result};
use chrono::Duration;
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A held lock: key plus the random holder token that proves ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    pub token: String,
}

/// Distributed lock client over the shared store
///
/// A lock whose TTL has elapsed is free even if the holder never released
/// it; only the holder whose token matches may release or refresh.
#[derive(Debug, Clone)]
pub struct LockClient {
    pool: SqlitePool,
}

impl LockClient {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic set-if-absent with TTL. Takes over expired rows; live
    /// contention returns `LockHeld`.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let expires_at = to_rfc3339(utc_now() + ttl);

        let result = sqlx::query(
            r#"
            INSERT INTO locks (key, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE
            SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(&expires_at)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to acquire lock {}: {}", key, e)))?;

        if result.rows_affected() == 0 {
            debug!(key, "Lock contention");
            return Err(Error::LockHeld(format!("Lock {} is held", key)));
        }

        debug!(key, "Lock acquired");
        Ok(Lock {
            key: key.to_string(),
            token,
        })
    }

    /// Non-blocking variant: identical to `acquire` in this backend, named
    /// separately to keep call sites honest about contention handling.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.acquire(key, ttl).await
    }

    /// Compare-and-delete by (key, token); a lock that already expired and
    /// was taken over is left alone.
    pub async fn release(&self, lock: &Lock) -> Result<()> {
        self.release_by_key_value(&lock.key, &lock.token).await
    }

    /// Cross-process release path for handlers that only carry key + token
    pub async fn release_by_key_value(&self, key: &str, token: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM locks WHERE key = ? AND holder = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to release lock {}: {}", key, e)))?;

        if result.rows_affected() == 0 {
            debug!(key, "Lock already released or taken over");
        } else {
            debug!(key, "Lock released");
        }
        Ok(())
    }

    /// Diagnostics: does a live row exist, and which token holds it
    pub async fn check(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT holder, expires_at FROM locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to check lock {}: {}", key, e)))?;

        match row {
            Some(row) => {
                let expires_at: String = row.get("expires_at");
                if parse_rfc3339(&expires_at)? <= utc_now() {
                    return Ok(None);
                }
                Ok(Some(row.get("holder")))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-set a new TTL; fails with `LockHeld` if the caller no
    /// longer owns the key.
    pub async fn refresh(&self, lock: &Lock, ttl: Duration) -> Result<()> {
        let expires_at = to_rfc3339(utc_now() + ttl);
        let result = sqlx::query("UPDATE locks SET expires_at = ? WHERE key = ? AND holder = ?")
            .bind(&expires_at)
            .bind(&lock.key)
            .bind(&lock.token)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to refresh lock {}: {}", lock.key, e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::LockHeld(format!(
                "Lock {} is no longer held by this token",
                lock.key
            )));
        }
        Ok(())
    }

    /// Spawn a background renewer extending the TTL each `interval`. The
    /// returned guard stops the renewer cooperatively; it also stops on its
    /// own if a refresh is rejected (ownership lost).
    pub fn auto_refresh(
        &self,
        lock: Lock,
        ttl: Duration,
        interval: std::time::Duration,
    ) -> AutoRefresh {
        let client = self.clone();
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        debug!(key = %lock.key, "Auto-refresh stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        match client.refresh(&lock, ttl).await {
                            Ok(()) => {}
                            Err(Error::LockHeld(_)) => {
                                warn!(key = %lock.key, "Lock ownership lost, stopping auto-refresh");
                                return;
                            }
                            Err(e) => {
                                // Transient store failure: keep trying while the lease lasts
                                warn!(key = %lock.key, error = %e, "Lock refresh failed");
                            }
                        }
                    }
                }
            }
        });

        AutoRefresh { cancel, handle }
    }

    /// Delete expired rows (housekeeping)
    pub async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at <= ?")
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to sweep expired locks: {}", e)))?;

        let n = result.rows_affected();
        if n > 0 {
            debug!(count = n, "Swept expired locks");
        }
        Ok(n)
    }
}

/// Stop handle for an auto-refresh loop
pub struct AutoRefresh {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl AutoRefresh {
    /// Stop the renewer and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ch_db::Db;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn create_test_pool() -> SqlitePool {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("Failed to open in-memory db");
        Db::attach(pool.clone())
            .migrate()
            .await
            .expect("Failed to migrate");
        pool
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let client = LockClient::new(create_test_pool().await);

        let lock = client.acquire("dispatch", Duration::seconds(30)).await.unwrap();
        assert_eq!(client.check("dispatch").await.unwrap(), Some(lock.token.clone()));

        client.release(&lock).await.unwrap();
        assert_eq!(client.check("dispatch").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let client = LockClient::new(create_test_pool().await);

        let lock = client.acquire("sweep", Duration::seconds(30)).await.unwrap();
        let contended = client.try_acquire("sweep", Duration::seconds(30)).await;
        assert!(matches!(contended, Err(Error::LockHeld(_))));

        client.release(&lock).await.unwrap();
        client.try_acquire("sweep", Duration::seconds(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_takeover() {
        let client = LockClient::new(create_test_pool().await);

        let stale = client.acquire("leader", Duration::seconds(-1)).await.unwrap();
        // The lease already elapsed, so a second acquirer takes over
        let fresh = client.acquire("leader", Duration::seconds(30)).await.unwrap();
        assert_ne!(stale.token, fresh.token);

        // The evicted holder's release is a no-op and does not free the key
        client.release(&stale).await.unwrap();
        assert_eq!(client.check("leader").await.unwrap(), Some(fresh.token));
    }

    #[tokio::test]
    async fn test_refresh_requires_ownership() {
        let client = LockClient::new(create_test_pool().await);

        let lock = client.acquire("refresh", Duration::seconds(30)).await.unwrap();
        client.refresh(&lock, Duration::seconds(60)).await.unwrap();

        let stranger = Lock {
            key: "refresh".to_string(),
            token: "not-the-holder".to_string(),
        };
        assert!(matches!(
            client.refresh(&stranger, Duration::seconds(60)).await,
            Err(Error::LockHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_refresh_keeps_lease_alive() {
        let client = LockClient::new(create_test_pool().await);

        let lock = client.acquire("renewed", Duration::seconds(1)).await.unwrap();
        let refresher = client.auto_refresh(
            lock.clone(),
            Duration::seconds(2),
            std::time::Duration::from_millis(50),
        );

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        // Still held well past the original one-second lease window start
        assert_eq!(client.check("renewed").await.unwrap(), Some(lock.token.clone()));

        refresher.stop().await;
        client.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let client = LockClient::new(create_test_pool().await);

        client.acquire("gone", Duration::seconds(-1)).await.unwrap();
        client.acquire("alive", Duration::seconds(60)).await.unwrap();

        let swept = client.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(client.check("alive").await.unwrap().is_some());
    }
}
