//! API-key authentication store.
//!
//! Plaintext keys are never stored or logged: the SHA-256 hex digest is the
//! relational lookup key and the cache key. Records are cached for a short
//! TTL; admin mutations invalidate by hash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::Cache;
use crate::db::{self, ApiKeyRow};
use crate::error::GatewayError;
use crate::server::AppState;

/// In-memory view of one client API key and its policy.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: Uuid,
    pub name: String,
    /// Empty means "any model".
    pub allowed_models: Vec<String>,
    /// 0 means unlimited.
    pub rate_limit_per_minute: i64,
    pub monthly_budget_usd: Option<f64>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
}

impl KeyRecord {
    /// An empty allow-list admits every model.
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn is_valid(&self) -> bool {
        self.enabled && self.expires_at.map_or(true, |exp| Utc::now() < exp)
    }

    /// Legacy collapse kept for the authentication middleware:
    /// revoked ⇔ disabled ∨ expired.
    pub fn revoked(&self) -> bool {
        !self.is_valid()
    }
}

impl From<ApiKeyRow> for KeyRecord {
    fn from(row: ApiKeyRow) -> Self {
        KeyRecord {
            id: row.id,
            name: row.name,
            allowed_models: row.allowed_models.unwrap_or_default(),
            rate_limit_per_minute: row.rate_limit_per_minute as i64,
            monthly_budget_usd: row.monthly_budget_usd,
            enabled: row.enabled,
            expires_at: row.expires_at,
            tags: row.tags.map(|json| json.0).unwrap_or_default(),
        }
    }
}

/// Hex-encoded SHA-256 of the plaintext key.
pub fn hash_api_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

#[derive(Debug, thiserror::Error)]
pub enum KeyLookupError {
    #[error("API key not found")]
    NotFound,
    #[error("key store error: {0}")]
    Internal(String),
}

pub struct ApiKeyStore {
    pool: PgPool,
    cache: Cache<String, Arc<KeyRecord>>,
}

impl ApiKeyStore {
    pub fn new(pool: PgPool, cache_size: usize, cache_ttl: Duration) -> Self {
        ApiKeyStore {
            pool,
            cache: Cache::new(cache_size, cache_ttl),
        }
    }

    /// Resolve a plaintext key to its record: hash, check the cache, fall back
    /// to a single point lookup and cache the result.
    pub async fn lookup(&self, plaintext: &str) -> Result<Arc<KeyRecord>, KeyLookupError> {
        let key_hash = hash_api_key(plaintext);

        if let Some(record) = self.cache.get(&key_hash) {
            return Ok(record);
        }

        let row = db::fetch_api_key_by_hash(&self.pool, &key_hash)
            .await
            .map_err(|e| KeyLookupError::Internal(e.to_string()))?
            .ok_or(KeyLookupError::NotFound)?;

        let record = Arc::new(KeyRecord::from(row));
        self.cache.insert(key_hash, Arc::clone(&record));
        Ok(record)
    }

    /// Drop a cached record by key hash (admin mutation path).
    pub fn invalidate(&self, key_hash: &str) {
        self.cache.remove(&key_hash.to_string());
    }

    pub fn sweep_expired(&self) -> usize {
        self.cache.cleanup_expired()
    }
}

/// Pull the client key out of `Authorization: Bearer …` or `X-API-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Authentication middleware for the `/v1` surface. Materialises the
/// `Arc<KeyRecord>` into request extensions; handlers read it from there.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_api_key(request.headers()) else {
        return GatewayError::Unauthorized("Missing API key".to_string()).into_response();
    };

    match state.keys.lookup(&token).await {
        Ok(record) => {
            if record.revoked() {
                let message = if !record.enabled {
                    "API key disabled"
                } else {
                    "API key expired"
                };
                return GatewayError::Unauthorized(message.to_string()).into_response();
            }
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        // Do not reveal whether the key exists.
        Err(KeyLookupError::NotFound) => {
            GatewayError::Unauthorized("Invalid API key".to_string()).into_response()
        }
        Err(KeyLookupError::Internal(e)) => {
            tracing::error!(error = %e, "API key lookup failed");
            GatewayError::Internal("API key lookup failed".to_string()).into_response()
        }
    }
}
