//! Provider/model/alias registry.
//!
//! The registry owns the live provider instances and an immutable resolution
//! snapshot that is replaced atomically on reload. The hot path reads the
//! snapshot pointer and never takes a lock. Reloads run on a timer and on a
//! best-effort trigger kicked by admin mutations; superseded providers are
//! closed after a short grace period so in-flight requests can finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::config::Settings;
use crate::credentials::CredentialCipher;
use crate::db;
use crate::pricing::{Direction, Modality, PriceTier, PriceUnit, PricingComponent};
use crate::providers::{ChatProvider, Credentials, ProviderConfig, ProviderKind};

/// How long superseded providers stay alive after a snapshot swap.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry load failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// Pricing-enabled model details, shared between the snapshot and any
/// requests still metering against an older snapshot.
#[derive(Debug, Clone)]
pub struct ModelDetails {
    pub id: Uuid,
    pub model_name: String,
    pub provider_id: Uuid,
    pub deprecated: bool,
    pub currency: String,
    pub pricing: Vec<PricingComponent>,
}

/// Result of resolving a lookup name.
#[derive(Clone)]
pub struct ResolvedModel {
    pub provider: Arc<ChatProvider>,
    /// The concrete provider model name; permission checks use this, so
    /// aliases cannot widen a key's allow-list.
    pub resolved_name: String,
    pub details: Arc<ModelDetails>,
    /// The public name the client asked for (model name or alias).
    pub lookup_name: String,
    /// Alias override config, merged into the payload at dispatch.
    pub override_config: Option<Arc<Value>>,
}

pub struct AliasEntry {
    pub alias: String,
    pub target_model_id: Uuid,
    pub override_config: Option<Value>,
    pub enabled: bool,
}

pub(crate) struct Snapshot {
    providers_by_id: HashMap<Uuid, Arc<ChatProvider>>,
    providers_by_name: HashMap<String, Arc<ChatProvider>>,
    model_index: HashMap<String, ResolvedModel>,
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot {
            providers_by_id: HashMap::new(),
            providers_by_name: HashMap::new(),
            model_index: HashMap::new(),
        }
    }

    /// Build the resolution index. Lookup is case-insensitive; a model's own
    /// name shadows an alias with the identical string; disabled aliases and
    /// models of unknown providers are invisible.
    pub(crate) fn build(
        providers: Vec<Arc<ChatProvider>>,
        models: Vec<ModelDetails>,
        aliases: Vec<AliasEntry>,
        index_capacity: usize,
    ) -> Self {
        let mut providers_by_id = HashMap::with_capacity(providers.len());
        let mut providers_by_name = HashMap::with_capacity(providers.len());
        for provider in providers {
            providers_by_id.insert(provider.id(), Arc::clone(&provider));
            providers_by_name.insert(provider.name().to_string(), provider);
        }

        let mut models_by_id: HashMap<Uuid, Arc<ModelDetails>> =
            HashMap::with_capacity(models.len());
        let mut model_index: HashMap<String, ResolvedModel> =
            HashMap::with_capacity(index_capacity.max(models.len()));

        for details in models {
            let details = Arc::new(details);
            models_by_id.insert(details.id, Arc::clone(&details));

            let Some(provider) = providers_by_id.get(&details.provider_id) else {
                tracing::warn!(
                    model = %details.model_name,
                    provider_id = %details.provider_id,
                    "model references unknown or disabled provider, skipping"
                );
                continue;
            };
            model_index.insert(
                details.model_name.to_lowercase(),
                ResolvedModel {
                    provider: Arc::clone(provider),
                    resolved_name: details.model_name.clone(),
                    lookup_name: details.model_name.clone(),
                    details,
                    override_config: None,
                },
            );
        }

        for alias in aliases {
            if !alias.enabled {
                continue;
            }
            let Some(details) = models_by_id.get(&alias.target_model_id) else {
                tracing::warn!(alias = %alias.alias, "alias targets unknown model, skipping");
                continue;
            };
            let Some(provider) = providers_by_id.get(&details.provider_id) else {
                continue;
            };
            // Direct model hits win over aliases with the same string.
            model_index
                .entry(alias.alias.to_lowercase())
                .or_insert_with(|| ResolvedModel {
                    provider: Arc::clone(provider),
                    resolved_name: details.model_name.clone(),
                    lookup_name: alias.alias.clone(),
                    details: Arc::clone(details),
                    override_config: alias.override_config.map(Arc::new),
                });
        }

        Snapshot {
            providers_by_id,
            providers_by_name,
            model_index,
        }
    }
}

pub struct ProviderRegistry {
    pool: PgPool,
    cipher: CredentialCipher,
    request_timeout: Duration,
    reload_interval: Duration,
    index_capacity: usize,
    snapshot: ArcSwap<Snapshot>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ProviderRegistry {
    pub fn new(pool: PgPool, cipher: CredentialCipher, settings: &Settings) -> Self {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        ProviderRegistry {
            pool,
            cipher,
            request_timeout: settings.provider_request_timeout,
            reload_interval: settings.provider_reload_interval,
            index_capacity: settings.cache_model_size,
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            reload_tx,
            reload_rx: Mutex::new(Some(reload_rx)),
        }
    }

    /// Resolve a model name or alias. Lock-free: one atomic snapshot load.
    pub fn resolve(&self, name: &str) -> Option<ResolvedModel> {
        self.snapshot.load().model_index.get(&name.to_lowercase()).cloned()
    }

    pub fn provider_by_name(&self, name: &str) -> Option<Arc<ChatProvider>> {
        self.snapshot.load().providers_by_name.get(name).cloned()
    }

    /// Everything currently resolvable, for the OpenAI-style model listing.
    pub fn list_models(&self) -> Vec<ResolvedModel> {
        let snapshot = self.snapshot.load();
        let mut entries: Vec<ResolvedModel> = snapshot.model_index.values().cloned().collect();
        entries.sort_by(|a, b| a.lookup_name.cmp(&b.lookup_name));
        entries
    }

    /// Non-blocking reload kick for admin mutation paths. A reload already in
    /// flight absorbs the trigger.
    pub fn trigger_reload(&self) {
        let _ = self.reload_tx.try_send(());
    }

    /// Re-read the catalogue and swap in a fresh snapshot.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let provider_rows = db::load_providers(&self.pool).await?;
        let model_rows = db::load_models(&self.pool).await?;
        let pricing_rows = db::load_pricing_components(&self.pool).await?;
        let alias_rows = db::load_aliases(&self.pool).await?;

        let mut providers = Vec::with_capacity(provider_rows.len());
        for row in provider_rows {
            if !row.enabled {
                continue;
            }
            let Some(kind) = ProviderKind::parse(&row.provider_type) else {
                tracing::warn!(provider = %row.name, kind = %row.provider_type, "unknown provider type, skipping");
                continue;
            };
            let credentials = match self.decode_credentials(row.encrypted_credentials.as_deref()) {
                Ok(creds) => creds,
                Err(e) => {
                    tracing::error!(provider = %row.name, error = %e, "failed to decode provider credentials, skipping");
                    continue;
                }
            };
            let config = ProviderConfig {
                id: row.id,
                name: row.name.clone(),
                kind,
                credentials,
                config: row.config.map(|json| json.0).unwrap_or_default(),
            };
            match ChatProvider::from_config(config, self.request_timeout) {
                Ok(provider) => providers.push(Arc::new(provider)),
                Err(e) => {
                    tracing::error!(provider = %row.name, error = %e, "failed to build provider, skipping");
                }
            }
        }

        let mut pricing_by_model: HashMap<Uuid, Vec<PricingComponent>> = HashMap::new();
        for row in pricing_rows {
            let Some(component) = parse_pricing_row(&row) else {
                tracing::warn!(
                    model_id = %row.model_id,
                    direction = %row.direction,
                    unit = %row.unit,
                    "pricing component with unknown enum value, skipping"
                );
                continue;
            };
            pricing_by_model.entry(row.model_id).or_default().push(component);
        }

        let models = model_rows
            .into_iter()
            .map(|row| ModelDetails {
                pricing: pricing_by_model.remove(&row.id).unwrap_or_default(),
                id: row.id,
                model_name: row.model_name,
                provider_id: row.provider_id,
                deprecated: row.deprecated,
                currency: row.currency,
            })
            .collect();

        let aliases = alias_rows
            .into_iter()
            .map(|row| AliasEntry {
                alias: row.alias,
                target_model_id: row.target_model_id,
                override_config: row.custom_config.map(|json| json.0),
                enabled: row.enabled,
            })
            .collect();

        let next = Snapshot::build(providers, models, aliases, self.index_capacity);
        tracing::info!(
            providers = next.providers_by_id.len(),
            lookup_names = next.model_index.len(),
            "registry snapshot swapped"
        );
        let old = self.snapshot.swap(Arc::new(next));

        // Let in-flight requests finish against the old instances, then close.
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            for provider in old.providers_by_id.values() {
                provider.close();
            }
        });

        Ok(())
    }

    fn decode_credentials(
        &self,
        encrypted: Option<&str>,
    ) -> Result<Credentials, Box<dyn std::error::Error + Send + Sync>> {
        match encrypted.filter(|s| !s.trim().is_empty()) {
            Some(encoded) => {
                let plaintext = self.cipher.decrypt(encoded)?;
                Ok(Credentials::from_json_bytes(&plaintext)?)
            }
            None => Ok(Credentials::default()),
        }
    }

    /// Timer + trigger loop. Runs until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut trigger_rx = self
            .reload_rx
            .lock()
            .await
            .take()
            .expect("registry reload loop started twice");

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.reload_interval,
            self.reload_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                triggered = trigger_rx.recv() => {
                    if triggered.is_none() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.reload().await {
                tracing::error!(error = %e, "registry reload failed, keeping previous snapshot");
            }
        }
    }

    /// Install a hand-built snapshot, bypassing the database.
    #[cfg(test)]
    pub(crate) fn install_snapshot_for_test(
        &self,
        providers: Vec<Arc<ChatProvider>>,
        models: Vec<ModelDetails>,
        aliases: Vec<AliasEntry>,
    ) {
        self.snapshot
            .store(Arc::new(Snapshot::build(providers, models, aliases, 16)));
    }

    /// Close every provider in the current snapshot (final shutdown step).
    pub fn close(&self) {
        for provider in self.snapshot.load().providers_by_id.values() {
            provider.close();
        }
    }
}

fn parse_pricing_row(row: &db::PricingComponentRow) -> Option<PricingComponent> {
    let tier = match row.tier.as_deref() {
        None => None,
        Some(raw) => Some(PriceTier::parse(raw)?),
    };
    Some(PricingComponent {
        direction: Direction::parse(&row.direction)?,
        modality: Modality::parse(&row.modality)?,
        unit: PriceUnit::parse(&row.unit)?,
        tier,
        scope: row.scope.clone(),
        price: row.price,
    })
}
