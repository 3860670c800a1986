//! Relational storage access.
//!
//! The gateway reads the key/provider/model catalogue and writes usage
//! records plus monthly summaries. All statements are plain parameterised SQL
//! against the schema owned by the admin service; nothing here migrates.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn connect(database_url: &str, pool_size: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
}

// ============================================================================
// Catalogue rows
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub name: String,
    pub allowed_models: Option<Vec<String>>,
    pub rate_limit_per_minute: i32,
    pub monthly_budget_usd: Option<f64>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Option<Json<HashMap<String, String>>>,
}

pub async fn fetch_api_key_by_hash(
    pool: &PgPool,
    key_hash: &str,
) -> Result<Option<ApiKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, ApiKeyRow>(
        "SELECT id, name, allowed_models, rate_limit_per_minute, monthly_budget_usd, \
                enabled, expires_at, tags \
         FROM api_keys WHERE key_hash = $1",
    )
    .bind(key_hash)
    .fetch_optional(pool)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct ProviderRow {
    pub id: Uuid,
    pub name: String,
    pub provider_type: String,
    pub encrypted_credentials: Option<String>,
    pub config: Option<Json<HashMap<String, String>>>,
    pub enabled: bool,
}

pub async fn load_providers(pool: &PgPool) -> Result<Vec<ProviderRow>, sqlx::Error> {
    sqlx::query_as::<_, ProviderRow>(
        "SELECT id, name, provider_type, encrypted_credentials, config, enabled \
         FROM providers ORDER BY name",
    )
    .fetch_all(pool)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct ModelRow {
    pub id: Uuid,
    pub model_name: String,
    pub provider_id: Uuid,
    pub deprecated: bool,
    pub currency: String,
}

pub async fn load_models(pool: &PgPool) -> Result<Vec<ModelRow>, sqlx::Error> {
    sqlx::query_as::<_, ModelRow>(
        "SELECT id, model_name, provider_id, deprecated, currency FROM models ORDER BY model_name",
    )
    .fetch_all(pool)
    .await
}

/// Raw pricing component; enum fields stay strings here and are parsed (and
/// unknown values skipped) when the registry builds `ModelDetails`.
#[derive(Debug, sqlx::FromRow)]
pub struct PricingComponentRow {
    pub model_id: Uuid,
    pub direction: String,
    pub modality: String,
    pub unit: String,
    pub tier: Option<String>,
    pub scope: Option<String>,
    pub price: f64,
}

pub async fn load_pricing_components(
    pool: &PgPool,
) -> Result<Vec<PricingComponentRow>, sqlx::Error> {
    // Stable order matters: the pricing model breaks ties by component order.
    sqlx::query_as::<_, PricingComponentRow>(
        "SELECT model_id, direction, modality, unit, tier, scope, price \
         FROM pricing_components ORDER BY model_id, id",
    )
    .fetch_all(pool)
    .await
}

#[derive(Debug, sqlx::FromRow)]
pub struct AliasRow {
    pub alias: String,
    pub target_model_id: Uuid,
    pub custom_config: Option<Json<serde_json::Value>>,
    pub enabled: bool,
}

pub async fn load_aliases(pool: &PgPool) -> Result<Vec<AliasRow>, sqlx::Error> {
    sqlx::query_as::<_, AliasRow>(
        "SELECT alias, target_model_id, custom_config, enabled FROM model_aliases ORDER BY alias",
    )
    .fetch_all(pool)
    .await
}

/// Bootstrap path: store an encrypted credential bundle on providers of the
/// given type that have none yet.
pub async fn seed_provider_credentials(
    pool: &PgPool,
    provider_type: &str,
    encrypted: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE providers SET encrypted_credentials = $1 \
         WHERE provider_type = $2 \
           AND (encrypted_credentials IS NULL OR encrypted_credentials = '')",
    )
    .bind(encrypted)
    .bind(provider_type)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Usage persistence
// ============================================================================

/// Audit record of one completed proxied request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UsageRow {
    pub id: Uuid,
    pub api_key_id: Uuid,
    pub request_id: Uuid,
    pub model_name: String,
    pub endpoint: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,
    pub response_time_ms: i64,
    pub status_code: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_usage_row(pool: &PgPool, row: &UsageRow) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    insert_usage_stmt(&mut tx, row).await?;
    for delta in summarize(std::slice::from_ref(row)) {
        upsert_summary_counts(&mut tx, &delta).await?;
    }
    tx.commit().await
}

/// Transactional batch insert. Either every row (and its summary increment)
/// commits, or none do.
pub async fn insert_usage_rows(pool: &PgPool, rows: &[UsageRow]) -> Result<(), sqlx::Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for row in rows {
        insert_usage_stmt(&mut tx, row).await?;
    }
    for delta in summarize(rows) {
        upsert_summary_counts(&mut tx, &delta).await?;
    }
    tx.commit().await
}

async fn insert_usage_stmt(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &UsageRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO usage_records \
             (id, api_key_id, request_id, model_name, endpoint, input_tokens, output_tokens, \
              cached_tokens, reasoning_tokens, response_time_ms, status_code, error_message, \
              created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(row.id)
    .bind(row.api_key_id)
    .bind(row.request_id)
    .bind(&row.model_name)
    .bind(&row.endpoint)
    .bind(row.input_tokens)
    .bind(row.output_tokens)
    .bind(row.cached_tokens)
    .bind(row.reasoning_tokens)
    .bind(row.response_time_ms)
    .bind(row.status_code)
    .bind(&row.error_message)
    .bind(row.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Per-(key, year, month) aggregate of a batch of usage rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDelta {
    pub api_key_id: Uuid,
    pub year: i32,
    pub month: i32,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Collapse a batch into summary increments, grouped by key and month.
pub fn summarize(rows: &[UsageRow]) -> Vec<SummaryDelta> {
    let mut grouped: HashMap<(Uuid, i32, i32), SummaryDelta> = HashMap::new();
    for row in rows {
        let year = row.created_at.year();
        let month = row.created_at.month() as i32;
        let delta = grouped
            .entry((row.api_key_id, year, month))
            .or_insert(SummaryDelta {
                api_key_id: row.api_key_id,
                year,
                month,
                requests: 0,
                input_tokens: 0,
                output_tokens: 0,
            });
        delta.requests += 1;
        delta.input_tokens += row.input_tokens;
        delta.output_tokens += row.output_tokens;
    }
    let mut deltas: Vec<SummaryDelta> = grouped.into_values().collect();
    deltas.sort_by_key(|d| (d.api_key_id, d.year, d.month));
    deltas
}

async fn upsert_summary_counts(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    delta: &SummaryDelta,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO monthly_usage_summaries \
             (api_key_id, year, month, total_requests, total_input_tokens, total_output_tokens, \
              total_cost_usd) \
         VALUES ($1, $2, $3, $4, $5, $6, 0) \
         ON CONFLICT (api_key_id, year, month) DO UPDATE SET \
             total_requests = monthly_usage_summaries.total_requests + EXCLUDED.total_requests, \
             total_input_tokens = monthly_usage_summaries.total_input_tokens + EXCLUDED.total_input_tokens, \
             total_output_tokens = monthly_usage_summaries.total_output_tokens + EXCLUDED.total_output_tokens",
    )
    .bind(delta.api_key_id)
    .bind(delta.year)
    .bind(delta.month)
    .bind(delta.requests)
    .bind(delta.input_tokens)
    .bind(delta.output_tokens)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Billing flusher path: the shared store holds the month's running spend, so
/// the flusher overwrites rather than increments.
pub async fn upsert_monthly_cost(
    pool: &PgPool,
    api_key_id: Uuid,
    year: i32,
    month: i32,
    total_cost_usd: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO monthly_usage_summaries \
             (api_key_id, year, month, total_requests, total_input_tokens, total_output_tokens, \
              total_cost_usd) \
         VALUES ($1, $2, $3, 0, 0, 0, $4) \
         ON CONFLICT (api_key_id, year, month) DO UPDATE SET \
             total_cost_usd = EXCLUDED.total_cost_usd",
    )
    .bind(api_key_id)
    .bind(year)
    .bind(month)
    .bind(total_cost_usd)
    .execute(pool)
    .await?;
    Ok(())
}
