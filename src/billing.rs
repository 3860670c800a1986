//! Cost-aware billing service.
//!
//! Current-month spend per key accumulates in the shared store under
//! `spend:{key}:{YYYY-MM}`, so budget checks are one GET and replicas agree.
//! Budget checks are fail-open: a metering outage must not halt traffic.
//! A background flusher mirrors the shard totals into the relational
//! `monthly_usage_summaries` table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::db;
use crate::keys::KeyRecord;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("billing store error: {0}")]
    Store(String),
    #[error("billing flush failed: {0}")]
    Flush(String),
}

/// One charge against a key's monthly spend.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BillingDelta {
    pub api_key_id: Uuid,
    pub cost_usd: f64,
    pub at: DateTime<Utc>,
}

/// Spend counter storage: the shared store in production, in-memory for
/// local and test contexts (mirrors the limiter's `noop` escape hatch).
pub enum SpendStore {
    Redis(ConnectionManager),
    Memory(Mutex<HashMap<String, f64>>),
}

impl SpendStore {
    pub fn memory() -> Self {
        SpendStore::Memory(Mutex::new(HashMap::new()))
    }

    async fn get(&self, key: &str) -> Result<Option<f64>, BillingError> {
        match self {
            SpendStore::Redis(conn) => {
                let mut conn = conn.clone();
                let raw: Option<String> = conn
                    .get(key)
                    .await
                    .map_err(|e| BillingError::Store(e.to_string()))?;
                Ok(raw.and_then(|s| s.parse().ok()))
            }
            SpendStore::Memory(map) => {
                Ok(map.lock().expect("spend store mutex poisoned").get(key).copied())
            }
        }
    }

    async fn incr(&self, key: &str, delta: f64) -> Result<f64, BillingError> {
        match self {
            SpendStore::Redis(conn) => {
                let mut conn = conn.clone();
                conn.incr(key, delta)
                    .await
                    .map_err(|e| BillingError::Store(e.to_string()))
            }
            SpendStore::Memory(map) => {
                let mut map = map.lock().expect("spend store mutex poisoned");
                let total = map.entry(key.to_string()).or_insert(0.0);
                *total += delta;
                Ok(*total)
            }
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BillingError> {
        match self {
            SpendStore::Redis(conn) => {
                let mut conn = conn.clone();
                let mut iter = conn
                    .scan_match::<_, String>(pattern)
                    .await
                    .map_err(|e| BillingError::Store(e.to_string()))?;
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            }
            SpendStore::Memory(map) => {
                // Only the `spend:*:{month}` shape is ever scanned.
                let suffix = pattern.rsplit(':').next().unwrap_or_default().to_string();
                Ok(map
                    .lock()
                    .expect("spend store mutex poisoned")
                    .keys()
                    .filter(|k| k.ends_with(&suffix))
                    .cloned()
                    .collect())
            }
        }
    }
}

pub struct BillingService {
    store: SpendStore,
    pool: PgPool,
}

impl BillingService {
    pub fn new(store: SpendStore, pool: PgPool) -> Self {
        BillingService { store, pool }
    }

    pub fn redis(conn: ConnectionManager, pool: PgPool) -> Self {
        Self::new(SpendStore::Redis(conn), pool)
    }

    /// True iff the key has no budget or its current-month spend is below it.
    /// Store failures default to allow.
    pub async fn within_budget(&self, key: &KeyRecord) -> bool {
        let Some(budget) = key.monthly_budget_usd else {
            return true;
        };
        match self.current_spend(key.id).await {
            Ok(spent) => spent < budget,
            Err(e) => {
                tracing::warn!(key_id = %key.id, error = %e, "budget check failed open");
                true
            }
        }
    }

    pub async fn current_spend(&self, key_id: Uuid) -> Result<f64, BillingError> {
        Ok(self
            .store
            .get(&spend_key(key_id, Utc::now()))
            .await?
            .unwrap_or(0.0))
    }

    /// Accumulate a charge. Best-effort: callers treat failures as log-only.
    pub async fn add_usage(&self, key_id: Uuid, cost_usd: f64) -> Result<(), BillingError> {
        if cost_usd <= 0.0 {
            return Ok(());
        }
        self.store
            .incr(&spend_key(key_id, Utc::now()), cost_usd)
            .await?;
        Ok(())
    }

    /// Mirror every current-month spend counter into the relational summary
    /// table. Returns how many keys were flushed.
    pub async fn flush(&self) -> Result<usize, BillingError> {
        let now = Utc::now();
        let pattern = format!("spend:*:{}", now.format("%Y-%m"));
        let keys = self.store.scan(&pattern).await?;

        let mut flushed = 0;
        for store_key in keys {
            let Some(api_key_id) = parse_spend_key(&store_key) else {
                tracing::warn!(key = %store_key, "unparseable spend key, skipping");
                continue;
            };
            let total = self.store.get(&store_key).await?.unwrap_or(0.0);

            db::upsert_monthly_cost(
                &self.pool,
                api_key_id,
                now.year(),
                now.month() as i32,
                total,
            )
            .await
            .map_err(|e| BillingError::Flush(e.to_string()))?;
            flushed += 1;
        }
        Ok(flushed)
    }

    pub async fn run_flusher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.flush().await {
                Ok(flushed) if flushed > 0 => {
                    tracing::debug!(keys = flushed, "billing totals flushed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "billing flush failed"),
            }
        }
    }

    /// Final flush within a deadline, for shutdown.
    pub async fn shutdown(&self, deadline: Duration) {
        match tokio::time::timeout(deadline, self.flush()).await {
            Ok(Ok(flushed)) => tracing::info!(keys = flushed, "final billing flush complete"),
            Ok(Err(e)) => tracing::error!(error = %e, "final billing flush failed"),
            Err(_) => tracing::error!("final billing flush timed out"),
        }
    }
}

pub fn spend_key(key_id: Uuid, at: DateTime<Utc>) -> String {
    format!("spend:{}:{}", key_id, at.format("%Y-%m"))
}

fn parse_spend_key(store_key: &str) -> Option<Uuid> {
    store_key.split(':').nth(1).and_then(|s| Uuid::parse_str(s).ok())
}
