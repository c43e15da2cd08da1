//! Advisory lock backed by a Postgres row (C10). `try_lock` is a single
//! `SELECT ... FOR UPDATE` + upsert inside one transaction; `lock` polls
//! it; `unlock` clears the row only for the owner that holds it.
//!
//! This is best-effort mutual exclusion for migration-style setup steps,
//! not a consistency mechanism the bus depends on for message delivery.

use std::time::Duration;

use async_trait::async_trait;
use broker_core::error::BrokerError;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// A lock row is considered abandoned after this much time with no
/// matching `unlock` — the holder is assumed to have crashed.
const ORPHAN_AFTER: chrono::Duration = chrono::Duration::minutes(5);

/// How often [`LockRepository::lock`] retries an unavailable lock.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(sqlx::FromRow)]
struct LockRow {
    #[allow(dead_code)]
    name: String,
    locked_by: String,
    locked_on: DateTime<Utc>,
    unlocked_on: Option<DateTime<Utc>>,
}

/// Named mutual exclusion over a shared store. `owner` identifies the
/// caller across `try_lock`/`lock`/`unlock` calls — typically a process
/// or instance id, not a user identity.
#[async_trait]
pub trait LockRepository: Send + Sync {
    async fn try_lock(&self, name: &str, owner: &str) -> Result<bool, BrokerError>;

    /// Polls `try_lock` until it succeeds.
    async fn lock(&self, name: &str, owner: &str) -> Result<(), BrokerError> {
        loop {
            if self.try_lock(name, owner).await? {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<(), BrokerError>;
}

/// True when a lock row with this `unlocked_on`/`locked_on` is free to
/// take — either explicitly released, or orphaned past the recovery
/// window.
fn should_acquire(unlocked_on: Option<DateTime<Utc>>, locked_on: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    unlocked_on.is_some() || now - locked_on > ORPHAN_AFTER
}

/// `sqlx::PgPool`-backed [`LockRepository`].
pub struct PgLockRepository {
    pool: PgPool,
}

impl PgLockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for PgLockRepository {
    async fn try_lock(&self, name: &str, owner: &str) -> Result<bool, BrokerError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<LockRow> = sqlx::query_as(
            "SELECT name, locked_by, locked_on, unlocked_on FROM api_lock WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let acquire = match &existing {
            None => true,
            Some(row) => should_acquire(row.unlocked_on, row.locked_on, now),
        };

        if !acquire {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO api_lock (name, locked_by, locked_on, unlocked_on) VALUES ($1, $2, $3, NULL)
             ON CONFLICT (name) DO UPDATE SET locked_by = EXCLUDED.locked_by, locked_on = EXCLUDED.locked_on, unlocked_on = NULL",
        )
        .bind(name)
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<LockRow> = sqlx::query_as(
            "SELECT name, locked_by, locked_on, unlocked_on FROM api_lock WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) if row.locked_by == owner => {
                sqlx::query("UPDATE api_lock SET unlocked_on = $1 WHERE name = $2")
                    .bind(Utc::now())
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }
            _ => {
                tx.rollback().await?;
                Err(BrokerError::Forbidden(format!("{owner} does not hold lock {name}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_row_is_free() {
        let now = Utc::now();
        assert!(should_acquire(Some(now), now, now));
    }

    #[test]
    fn fresh_held_lock_is_not_free() {
        let now = Utc::now();
        assert!(!should_acquire(None, now, now));
    }

    #[test]
    fn stale_lock_past_orphan_window_is_free() {
        let locked_on = Utc::now() - chrono::Duration::minutes(6);
        assert!(should_acquire(None, locked_on, Utc::now()));
    }

    #[test]
    fn lock_just_inside_orphan_window_is_not_free() {
        let locked_on = Utc::now() - chrono::Duration::minutes(4);
        assert!(!should_acquire(None, locked_on, Utc::now()));
    }
}
