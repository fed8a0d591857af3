//! Rolling-window token rate limiter.
//!
//! The durable record is an append-only ledger row per LLM call; the 24-hour
//! window is a read-time aggregate, never mutated in place. Two concurrent
//! requests from one user can both pass `check_limit` before either records,
//! overshooting the limit by at most one in-flight request's tokens. That is
//! an accepted trade-off: hard atomicity would serialize every request per
//! user, and this service does not do that.

use crate::UserId;
use crate::error::{DbError, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};

/// Window width. The limit is "tokens over the trailing 24 hours".
const WINDOW_SECONDS: i64 = 24 * 60 * 60;

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub usage_tokens: i64,
    pub limit_tokens: i64,
    pub usage_percent: f64,
    pub remaining_tokens: i64,
    /// Seconds until the oldest in-window usage ages out. Only meaningful
    /// when `allowed` is false; floored at zero.
    pub resets_in_seconds: i64,
    pub warning: bool,
}

/// Gates turns on rolling-window token usage and records consumption.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
    limit_tokens: i64,
    warning_percent: f64,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, limit_tokens: i64, warning_percent: f64) -> Self {
        Self {
            pool,
            limit_tokens,
            warning_percent,
        }
    }

    /// Check whether `user_id` may start a turn right now.
    pub async fn check_limit(&self, user_id: &UserId) -> Result<RateLimitStatus> {
        self.check_limit_at(user_id, Utc::now()).await
    }

    /// Record one LLM call's token consumption. Appends a ledger row with the
    /// current timestamp; prior rows are never touched.
    pub async fn record_usage(
        &self,
        user_id: &UserId,
        input_tokens: i64,
        output_tokens: i64,
    ) -> Result<()> {
        self.record_usage_at(user_id, input_tokens, output_tokens, Utc::now())
            .await
    }

    async fn check_limit_at(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<RateLimitStatus> {
        let window_start = now.timestamp() - WINDOW_SECONDS;

        let row = sqlx::query(
            "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) AS usage_tokens, \
                    MIN(timestamp) AS oldest \
             FROM usage_ledger \
             WHERE user_id = ?1 AND timestamp > ?2",
        )
        .bind(user_id)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        let usage_tokens: i64 = row.get("usage_tokens");
        let oldest: Option<i64> = row.get("oldest");

        // Strict less-than: a ledger summing to exactly the limit is denied.
        let allowed = usage_tokens < self.limit_tokens;
        let usage_percent = usage_tokens as f64 * 100.0 / self.limit_tokens as f64;
        let resets_in_seconds = oldest
            .map(|oldest| (oldest + WINDOW_SECONDS - now.timestamp()).max(0))
            .unwrap_or(0);

        Ok(RateLimitStatus {
            allowed,
            usage_tokens,
            limit_tokens: self.limit_tokens,
            usage_percent,
            remaining_tokens: (self.limit_tokens - usage_tokens).max(0),
            resets_in_seconds,
            warning: usage_percent >= self.warning_percent,
        })
    }

    async fn record_usage_at(
        &self,
        user_id: &UserId,
        input_tokens: i64,
        output_tokens: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_ledger (user_id, input_tokens, output_tokens, timestamp) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        tracing::debug!(
            user_id = %user_id,
            input_tokens,
            output_tokens,
            "recorded token usage"
        );
        Ok(())
    }
}
