use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::sync::watch;

use llm_gateway::billing::BillingService;
use llm_gateway::config::{ConfigError, Settings};
use llm_gateway::credentials::CredentialCipher;
use llm_gateway::db;
use llm_gateway::keys::ApiKeyStore;
use llm_gateway::limiter::RateLimiter;
use llm_gateway::queue::{
    spawn_queue, BillingSink, DeadLetterQueue, QueueConfig, UsageSink,
};
use llm_gateway::registry::{ProviderRegistry, RegistryError};
use llm_gateway::server::{self, AppState};

#[derive(Debug, thiserror::Error)]
enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "gateway failed to start or crashed");
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BootError> {
    let settings = Settings::from_env()?;

    let pool = db::connect(&settings.database_url, settings.database_pool_size).await?;
    let redis_client = redis::Client::open(settings.redis_url())?;
    let redis = ConnectionManager::new(redis_client).await?;

    let cipher = CredentialCipher::new(settings.encryption_key);
    seed_env_credentials(&pool, &cipher).await;

    // An unreadable catalogue at startup is fatal; later reload failures keep
    // the previous snapshot instead.
    let registry = Arc::new(ProviderRegistry::new(pool.clone(), cipher, &settings));
    registry.reload().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&registry).run(shutdown_rx.clone()));

    let limiter = Arc::new(RateLimiter::redis(redis.clone()));

    let billing = Arc::new(BillingService::redis(redis.clone(), pool.clone()));
    tokio::spawn(
        Arc::clone(&billing).run_flusher(settings.billing_flush_interval, shutdown_rx.clone()),
    );

    let queue_config = QueueConfig {
        capacity: settings.queue_capacity,
        batch_size: settings.queue_batch_size,
        batch_timeout: settings.queue_batch_timeout,
        max_retries: settings.queue_max_retries,
        retry_backoff: settings.queue_retry_backoff,
    };
    let dlq = Arc::new(DeadLetterQueue::redis(redis.clone()));
    let (billing_queue, billing_worker) = spawn_queue(
        "billing-updates",
        queue_config.clone(),
        BillingSink::new(Arc::clone(&billing)),
        Arc::clone(&dlq),
    );
    let (usage_queue, usage_worker) = spawn_queue(
        "usage-rows",
        queue_config,
        UsageSink::new(pool.clone()),
        dlq,
    );

    let keys = Arc::new(ApiKeyStore::new(
        pool.clone(),
        settings.cache_api_key_size,
        settings.cache_api_key_ttl,
    ));
    spawn_cache_sweeper(Arc::clone(&keys), settings.cache_api_key_ttl, shutdown_rx.clone());

    let state = AppState {
        keys,
        registry: Arc::clone(&registry),
        limiter,
        billing: Arc::clone(&billing),
        billing_queue,
        usage_queue,
    };

    let bind_address = settings.bind_address();
    let server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        server::serve(state, &bind_address, server_shutdown).await
    });

    server::shutdown_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Stop accepting and give in-flight requests up to 30 seconds.
    match tokio::time::timeout(Duration::from_secs(30), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "server exited with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "server task panicked"),
        Err(_) => tracing::warn!("in-flight requests did not drain within 30s"),
    }

    // Drain the persistence queues: billing first, then usage.
    billing_worker.stop(Duration::from_secs(10)).await;
    usage_worker.stop(Duration::from_secs(10)).await;

    billing.shutdown(Duration::from_secs(10)).await;
    registry.close();

    tracing::info!("shutdown complete");
    Ok(())
}

/// Provider API keys injected via environment are encrypted into provider
/// records that have no credentials yet, before the registry first loads.
async fn seed_env_credentials(pool: &PgPool, cipher: &CredentialCipher) {
    const SEEDS: [(&str, &str); 3] = [
        ("OPENAI_API_KEY", "openai"),
        ("VERTEX_API_KEY", "vertexai"),
        ("BEDROCK_API_KEY", "bedrock"),
    ];

    for (var, provider_type) in SEEDS {
        let Ok(secret) = std::env::var(var) else {
            continue;
        };
        if secret.trim().is_empty() {
            continue;
        }
        let bundle = serde_json::json!({ "api_key": secret }).to_string();
        let encrypted = match cipher.encrypt(bundle.as_bytes()) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                tracing::warn!(provider_type, error = %e, "failed to encrypt seeded credentials");
                continue;
            }
        };
        match db::seed_provider_credentials(pool, provider_type, &encrypted).await {
            Ok(0) => {}
            Ok(rows) => {
                tracing::info!(provider_type, rows, "seeded provider credentials from environment");
            }
            Err(e) => {
                tracing::warn!(provider_type, error = %e, "failed to seed provider credentials");
            }
        }
    }
}

fn spawn_cache_sweeper(
    keys: Arc<ApiKeyStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = keys.sweep_expired();
                    if swept > 0 {
                        tracing::debug!(swept, "expired API key cache entries removed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}
