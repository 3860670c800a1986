//! Distributed per-key rate limiter.
//!
//! Fixed one-minute windows counted in the shared store, so every gateway
//! replica sees the same counter. The increment and the first-write expiry
//! travel in a single atomic round trip. Store failures are fail-closed: the
//! handler surfaces 500 rather than silently admitting traffic.
//!
//! Two extra variants exist for contexts without a shared store: `Memory`
//! keeps the same window arithmetic in-process (single instance only), and
//! `Noop` always admits.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use redis::aio::ConnectionManager;
use uuid::Uuid;

const WINDOW_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("rate limit store error: {0}")]
    Store(String),
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    /// -1 when the key is unlimited.
    pub remaining: i64,
    /// Unix seconds of the next window start; `None` when unlimited.
    pub reset_at: Option<i64>,
}

impl RateDecision {
    fn unlimited() -> Self {
        RateDecision {
            allowed: true,
            limit: 0,
            remaining: -1,
            reset_at: None,
        }
    }

    /// Seconds until the window resets, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> i64 {
        match self.reset_at {
            Some(reset) => (reset - Utc::now().timestamp()).max(1),
            None => 1,
        }
    }
}

pub enum RateLimiter {
    Redis(RedisRateLimiter),
    /// In-process window counters. Replicas will not agree, so this is for
    /// local and test contexts only.
    Memory(Mutex<HashMap<String, i64>>),
    /// Always admits; for contexts that want no limiting at all.
    Noop,
}

impl RateLimiter {
    pub fn redis(conn: ConnectionManager) -> Self {
        RateLimiter::Redis(RedisRateLimiter { conn })
    }

    pub fn memory() -> Self {
        RateLimiter::Memory(Mutex::new(HashMap::new()))
    }

    /// Admission check for one request. `limit` 0 means unlimited and skips
    /// the store entirely.
    pub async fn allow_with_details(
        &self,
        key_id: Uuid,
        limit: i64,
    ) -> Result<RateDecision, LimiterError> {
        if limit <= 0 {
            return Ok(RateDecision::unlimited());
        }
        match self {
            RateLimiter::Redis(limiter) => limiter.allow(key_id, limit).await,
            RateLimiter::Memory(windows) => {
                let now = Utc::now().timestamp();
                let key = window_key(key_id, now);
                let mut windows = windows.lock().expect("limiter mutex poisoned");
                // Stale windows never get another hit; drop them as we go.
                windows.retain(|k, _| k.ends_with(&format!(":{}", now / WINDOW_SECS)));
                let counter = windows.entry(key).or_insert(0);
                *counter += 1;
                Ok(decide(*counter, limit, now))
            }
            RateLimiter::Noop => Ok(RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: None,
            }),
        }
    }

    /// Clear the current window for a key (admin path).
    pub async fn reset(&self, key_id: Uuid) -> Result<(), LimiterError> {
        match self {
            RateLimiter::Redis(limiter) => limiter.reset(key_id).await,
            RateLimiter::Memory(windows) => {
                let key = window_key(key_id, Utc::now().timestamp());
                windows.lock().expect("limiter mutex poisoned").remove(&key);
                Ok(())
            }
            RateLimiter::Noop => Ok(()),
        }
    }
}

pub struct RedisRateLimiter {
    conn: ConnectionManager,
}

impl RedisRateLimiter {
    async fn allow(&self, key_id: Uuid, limit: i64) -> Result<RateDecision, LimiterError> {
        let now = Utc::now().timestamp();
        let key = window_key(key_id, now);

        let mut conn = self.conn.clone();
        // INCR + EXPIRE NX in one MULTI/EXEC round trip: the expiry is set
        // only by the first increment of the window.
        let (counter, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(WINDOW_SECS)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;

        Ok(decide(counter, limit, now))
    }

    async fn reset(&self, key_id: Uuid) -> Result<(), LimiterError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(window_key(key_id, now))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;
        Ok(())
    }
}

fn window_key(key_id: Uuid, now_secs: i64) -> String {
    format!("ratelimit:{}:{}", key_id, now_secs / WINDOW_SECS)
}

fn decide(counter: i64, limit: i64, now_secs: i64) -> RateDecision {
    RateDecision {
        allowed: counter <= limit,
        limit,
        remaining: (limit - counter).max(0),
        reset_at: Some((now_secs / WINDOW_SECS + 1) * WINDOW_SECS),
    }
}
