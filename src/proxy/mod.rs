//! The request-path pipeline behind `POST /v1/chat/completions`.
//!
//! Order is fixed: authenticate (middleware) → precondition → decode →
//! extract → resolve → authorise → rate-limit → budget → dispatch → deliver →
//! meter. Every failure maps to one status from the taxonomy and an
//! OpenAI-shaped error body; metering is fire-and-forget and can never fail
//! the request.

pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::billing::BillingDelta;
use crate::db::UsageRow;
use crate::error::GatewayError;
use crate::keys::KeyRecord;
use crate::limiter::RateDecision;
use crate::pricing::{self, UsageReport};
use crate::providers::{ChatOutcome, ChatRequest};
use crate::registry::ResolvedModel;
use crate::server::AppState;

const ENDPOINT: &str = "/v1/chat/completions";
const ENDPOINT_STREAM: &str = "/v1/chat/completions?stream=true";

/// OpenAI-compatible chat completions entry point.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(key): Extension<Arc<KeyRecord>>,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    // Precondition re-check; the middleware already rejects revoked keys.
    if !key.is_valid() {
        let message = if !key.enabled {
            "API key disabled"
        } else {
            "API key expired"
        };
        return GatewayError::Unauthorized(message.to_string()).into_response();
    }

    let payload: Value = match serde_json::from_slice::<Value>(&body) {
        Ok(value) if value.is_object() => value,
        _ => {
            return GatewayError::InvalidRequest("request body must be a JSON object".to_string())
                .into_response()
        }
    };

    let Some(model) = payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
    else {
        return GatewayError::InvalidRequest("missing required field: model".to_string())
            .into_response();
    };
    let stream = read_stream_flag(&payload);

    let Some(target) = state.registry.resolve(&model) else {
        return GatewayError::InvalidRequest(format!("unknown model: {model}")).into_response();
    };

    // Permission is checked against the resolved provider model name, so an
    // alias cannot sidestep the allow-list.
    if !key.allows_model(&target.resolved_name) {
        return GatewayError::Forbidden("API key not allowed to use this model".to_string())
            .into_response();
    }

    // Fail-closed: a limiter outage turns into 500, never a free pass.
    let decision = match state
        .limiter
        .allow_with_details(key.id, key.rate_limit_per_minute)
        .await
    {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "rate limiter unavailable");
            return GatewayError::Internal("rate limiter unavailable".to_string()).into_response();
        }
    };
    if !decision.allowed {
        tracing::info!(request_id = %request_id, key_id = %key.id, "rate limit exceeded");
        return GatewayError::RateLimited {
            message: "rate limit exceeded".to_string(),
            limit: decision.limit,
            remaining: decision.remaining,
            retry_after_secs: decision.retry_after_secs(),
            reset_at: decision.reset_at.unwrap_or_default(),
        }
        .into_response();
    }

    // Fail-open lives inside within_budget; denial is checked before dispatch
    // so the upstream is never called for an exhausted key.
    if !state.billing.within_budget(&key).await {
        tracing::info!(request_id = %request_id, key_id = %key.id, "monthly budget exceeded");
        let response =
            GatewayError::BudgetExceeded("monthly budget exceeded".to_string()).into_response();
        return with_rate_headers(response, &decision);
    }

    let mut payload = payload;
    if let Some(overrides) = target.override_config.as_deref() {
        apply_alias_overrides(&mut payload, overrides);
    }

    let chat_request = ChatRequest {
        model: target.resolved_name.clone(),
        payload,
        stream,
    };

    let response = match target.provider.chat(chat_request).await {
        Err(e) => {
            tracing::warn!(
                request_id = %request_id,
                provider = %target.provider.name(),
                model = %target.resolved_name,
                error = %e,
                "provider dispatch failed"
            );
            record_usage(
                &state,
                make_usage_row(
                    request_id,
                    &key,
                    &target,
                    ENDPOINT,
                    UsageReport::default(),
                    started.elapsed().as_millis() as i64,
                    502,
                    Some(e.to_string()),
                ),
            );
            GatewayError::Upstream(format!("provider error: {e}")).into_response()
        }
        Ok(ChatOutcome::Buffered(upstream)) => {
            let cost = pricing::cost_for_usage(&target.details.pricing, &upstream.usage);
            let elapsed_ms = started.elapsed().as_millis() as i64;
            tracing::info!(
                request_id = %request_id,
                model = %target.resolved_name,
                input_tokens = upstream.usage.input_tokens,
                output_tokens = upstream.usage.output_tokens,
                cost_usd = cost,
                elapsed_ms,
                "request completed"
            );

            if cost > 0.0 {
                record_billing(
                    &state,
                    BillingDelta {
                        api_key_id: key.id,
                        cost_usd: cost,
                        at: Utc::now(),
                    },
                );
            }
            record_usage(
                &state,
                make_usage_row(
                    request_id,
                    &key,
                    &target,
                    ENDPOINT,
                    upstream.usage,
                    elapsed_ms,
                    upstream.status as i32,
                    None,
                ),
            );

            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
            (status, Json(upstream.body)).into_response()
        }
        Ok(ChatOutcome::Streaming(upstream)) => {
            // Streaming responses bill zero until chunk usage parsing lands;
            // the row still records the request with stream metadata.
            let row = make_usage_row(
                request_id,
                &key,
                &target,
                ENDPOINT_STREAM,
                UsageReport::default(),
                0,
                upstream.status as i32,
                None,
            );
            let finalizer = sse::UsageFinalizer::new(state.usage_queue.clone(), row, started);
            sse::streaming_response(upstream, finalizer)
        }
    };

    with_rate_headers(response, &decision)
}

/// OpenAI-style model listing, served from the registry snapshot.
pub async fn list_models(State(state): State<AppState>) -> Response {
    let data: Vec<Value> = state
        .registry
        .list_models()
        .into_iter()
        .map(|entry| model_object(&entry))
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

pub async fn get_model(State(state): State<AppState>, Path(model_id): Path<String>) -> Response {
    match state.registry.resolve(&model_id) {
        Some(entry) => Json(model_object(&entry)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "message": format!("model '{model_id}' not found"),
                    "type": "invalid_request_error",
                    "code": 404,
                }
            })),
        )
            .into_response(),
    }
}

fn model_object(entry: &ResolvedModel) -> Value {
    json!({
        "id": entry.lookup_name,
        "object": "model",
        "created": 1_700_000_000,
        "owned_by": entry.provider.name(),
        "root": entry.resolved_name,
    })
}

/// Lenient stream flag: clients send booleans, but numbers and strings show
/// up in the wild.
fn read_stream_flag(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

/// Merge an alias's override config into the payload. Overrides win over
/// client fields; `model` and `stream` stay under pipeline control.
fn apply_alias_overrides(payload: &mut Value, overrides: &Value) {
    let (Some(body), Some(overrides)) = (payload.as_object_mut(), overrides.as_object()) else {
        return;
    };
    for (field, value) in overrides {
        if field == "model" || field == "stream" {
            continue;
        }
        body.insert(field.clone(), value.clone());
    }
}

fn with_rate_headers(mut response: Response, decision: &RateDecision) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Some(reset) = decision.reset_at {
        if let Ok(value) = reset.to_string().parse() {
            headers.insert("x-ratelimit-reset", value);
        }
    }
    response
}

#[allow(clippy::too_many_arguments)]
fn make_usage_row(
    request_id: Uuid,
    key: &KeyRecord,
    target: &ResolvedModel,
    endpoint: &str,
    usage: UsageReport,
    response_time_ms: i64,
    status_code: i32,
    error_message: Option<String>,
) -> UsageRow {
    UsageRow {
        id: Uuid::new_v4(),
        api_key_id: key.id,
        request_id,
        model_name: target.resolved_name.clone(),
        endpoint: endpoint.to_string(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_tokens: usage.cached_tokens,
        reasoning_tokens: usage.reasoning_tokens,
        response_time_ms,
        status_code,
        error_message,
        created_at: Utc::now(),
    }
}

fn record_usage(state: &AppState, row: UsageRow) {
    if let Err(e) = state.usage_queue.enqueue(row) {
        tracing::warn!(error = %e, "failed to enqueue usage row");
    }
}

fn record_billing(state: &AppState, delta: BillingDelta) {
    if let Err(e) = state.billing_queue.enqueue(delta) {
        tracing::warn!(error = %e, "failed to enqueue billing delta");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BillingService, SpendStore};
    use crate::config::Settings;
    use crate::credentials::CredentialCipher;
    use crate::keys::ApiKeyStore;
    use crate::limiter::RateLimiter;
    use crate::pricing::{Direction, Modality, PriceUnit, PricingComponent};
    use crate::providers::{ChatProvider, Credentials, ProviderConfig, ProviderKind};
    use crate::queue::WorkQueue;
    use crate::registry::{AliasEntry, ModelDetails, ProviderRegistry};
    use axum::body::to_bytes;
    use axum::routing::post;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        state: AppState,
        key: Arc<KeyRecord>,
        usage_rx: mpsc::Receiver<UsageRow>,
        billing_rx: mpsc::Receiver<BillingDelta>,
        upstream_calls: Arc<AtomicUsize>,
    }

    fn lazy_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://gw:gw@localhost/unreachable")
            .unwrap()
    }

    fn test_settings() -> Settings {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL", "postgres://gw:gw@localhost/unreachable");
        env.insert(
            "ENCRYPTION_KEY",
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        );
        Settings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap()
    }

    fn per_1k(direction: Direction, price: f64) -> PricingComponent {
        PricingComponent {
            direction,
            modality: Modality::Text,
            unit: PriceUnit::PerThousandTokens,
            tier: None,
            scope: None,
            price,
        }
    }

    fn base_key() -> KeyRecord {
        KeyRecord {
            id: Uuid::new_v4(),
            name: "client".to_string(),
            allowed_models: Vec::new(),
            rate_limit_per_minute: 100,
            monthly_budget_usd: None,
            enabled: true,
            expires_at: None,
            tags: HashMap::new(),
        }
    }

    /// Spin up a mock OpenAI-shaped upstream and a fully wired AppState whose
    /// registry resolves `gpt-4o`, `gpt-3.5-turbo` and the alias `fast`.
    async fn harness(upstream: Router, key: KeyRecord) -> Harness {
        let upstream_calls = Arc::new(AtomicUsize::new(0));
        let counting = {
            let calls = Arc::clone(&upstream_calls);
            upstream.layer(axum::middleware::from_fn(
                move |request: axum::extract::Request, next: axum::middleware::Next| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        next.run(request).await
                    }
                },
            ))
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, counting).await.unwrap() });
        let base_url = format!("http://{addr}/v1");

        let provider_id = Uuid::new_v4();
        let mut creds = HashMap::new();
        creds.insert("api_key".to_string(), "sk-upstream".to_string());
        let mut config = HashMap::new();
        config.insert("base_url".to_string(), base_url);
        let provider = Arc::new(
            ChatProvider::from_config(
                ProviderConfig {
                    id: provider_id,
                    name: "openai-main".to_string(),
                    kind: ProviderKind::OpenAi,
                    credentials: Credentials::from_map(creds),
                    config,
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        );

        let gpt4o = Uuid::new_v4();
        let gpt35 = Uuid::new_v4();
        let models = vec![
            ModelDetails {
                id: gpt4o,
                model_name: "gpt-4o".to_string(),
                provider_id,
                deprecated: false,
                currency: "USD".to_string(),
                pricing: vec![
                    per_1k(Direction::Input, 0.0025),
                    per_1k(Direction::Output, 0.01),
                ],
            },
            ModelDetails {
                id: gpt35,
                model_name: "gpt-3.5-turbo".to_string(),
                provider_id,
                deprecated: false,
                currency: "USD".to_string(),
                pricing: Vec::new(),
            },
        ];
        let aliases = vec![AliasEntry {
            alias: "fast".to_string(),
            target_model_id: gpt35,
            override_config: None,
            enabled: true,
        }];

        let settings = test_settings();
        let registry = Arc::new(ProviderRegistry::new(
            lazy_pool(),
            CredentialCipher::new(settings.encryption_key),
            &settings,
        ));
        registry.install_snapshot_for_test(vec![provider], models, aliases);

        let (usage_tx, usage_rx) = mpsc::channel(16);
        let (billing_tx, billing_rx) = mpsc::channel(16);

        let state = AppState {
            keys: Arc::new(ApiKeyStore::new(
                lazy_pool(),
                8,
                Duration::from_secs(60),
            )),
            registry,
            limiter: Arc::new(RateLimiter::Noop),
            billing: Arc::new(BillingService::new(SpendStore::memory(), lazy_pool())),
            usage_queue: WorkQueue::for_test("usage", usage_tx),
            billing_queue: WorkQueue::for_test("billing", billing_tx),
        };

        Harness {
            state,
            key: Arc::new(key),
            usage_rx,
            billing_rx,
            upstream_calls,
        }
    }

    fn happy_upstream() -> Router {
        Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "model": body["model"],
                    "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                    "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
                }))
            }),
        )
    }

    async fn call(harness: &mut Harness, body: Value) -> Response {
        chat_completions(
            State(harness.state.clone()),
            Extension(Arc::clone(&harness.key)),
            Bytes::from(body.to_string()),
        )
        .await
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn happy_non_streaming_meters_cost_and_usage() {
        let mut h = harness(happy_upstream(), base_key()).await;
        let response = call(
            &mut h,
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        let body = json_body(response).await;
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["usage"]["prompt_tokens"], 1000);

        let row = h.usage_rx.try_recv().unwrap();
        assert_eq!(row.input_tokens, 1000);
        assert_eq!(row.output_tokens, 500);
        assert_eq!(row.status_code, 200);
        assert_eq!(row.model_name, "gpt-4o");
        assert_eq!(row.endpoint, ENDPOINT);
        assert!(h.usage_rx.try_recv().is_err(), "exactly one usage row");

        // 1000 input at $0.0025/1k + 500 output at $0.01/1k.
        let delta = h.billing_rx.try_recv().unwrap();
        assert!((delta.cost_usd - 0.0075).abs() < 1e-12);
        assert!(h.billing_rx.try_recv().is_err(), "exactly one billing delta");
    }

    #[tokio::test]
    async fn alias_resolves_but_cannot_bypass_allow_list() {
        let mut restricted = base_key();
        restricted.allowed_models = vec!["gpt-4o".to_string()];
        let mut h = harness(happy_upstream(), restricted).await;

        // "fast" resolves to gpt-3.5-turbo, which the key may not use.
        let response = call(&mut h, json!({"model": "fast", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(
            body["error"]["message"],
            "API key not allowed to use this model"
        );
        assert_eq!(h.upstream_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn alias_dispatches_with_resolved_model_name() {
        let mut h = harness(happy_upstream(), base_key()).await;
        let response = call(&mut h, json!({"model": "fast", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        // The upstream saw the resolved name, not the alias.
        assert_eq!(body["model"], "gpt-3.5-turbo");
        let row = h.usage_rx.try_recv().unwrap();
        assert_eq!(row.model_name, "gpt-3.5-turbo");
        // No pricing components on gpt-3.5-turbo, so no billing delta.
        assert!(h.billing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_model_is_a_literal_400() {
        let mut h = harness(happy_upstream(), base_key()).await;
        let response = call(&mut h, json!({"model": "gpt-99", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({"error": {"message": "unknown model: gpt-99", "type": "invalid_request_error", "code": 400}})
        );
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected() {
        let mut h = harness(happy_upstream(), base_key()).await;

        let response = call(&mut h, json!("not an object")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = chat_completions(
            State(h.state.clone()),
            Extension(Arc::clone(&h.key)),
            Bytes::from_static(b"{\"model\": "),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(&mut h, json!({"messages": []})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "missing required field: model");
    }

    #[tokio::test]
    async fn budget_denial_precedes_dispatch() {
        let mut key = base_key();
        key.monthly_budget_usd = Some(0.01);
        let mut h = harness(happy_upstream(), key).await;

        // Spend already over the monthly budget.
        h.state
            .billing
            .add_usage(h.key.id, 0.012)
            .await
            .unwrap();

        let response = call(&mut h, json!({"model": "gpt-4o", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "monthly budget exceeded");
        assert_eq!(h.upstream_calls.load(Ordering::SeqCst), 0, "upstream not called");
        assert!(h.usage_rx.try_recv().is_err());
    }

    /// Window-boundary guard: if the minute is about to roll over, wait for
    /// the fresh window so sequential counting stays in one window.
    async fn hold_window_open() {
        let into_window = Utc::now().timestamp() % 60;
        if into_window >= 57 {
            tokio::time::sleep(Duration::from_secs((60 - into_window + 1) as u64)).await;
        }
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_returns_429_with_hint_headers() {
        let mut key = base_key();
        key.rate_limit_per_minute = 3;
        let mut h = harness(happy_upstream(), key).await;
        h.state.limiter = Arc::new(RateLimiter::memory());

        hold_window_open().await;
        for expected_remaining in ["2", "1", "0"] {
            let response = call(&mut h, json!({"model": "gpt-4o", "messages": []})).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()["x-ratelimit-remaining"],
                expected_remaining
            );
        }

        // Fourth request in the same window is refused with hint headers.
        let response = call(&mut h, json!({"model": "gpt-4o", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers().clone();
        assert_eq!(headers["x-ratelimit-limit"], "3");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert!(headers.contains_key("x-ratelimit-reset"));
        let retry_after: i64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry_after));

        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "rate limit exceeded");

        // Only the three admitted requests reached the upstream.
        assert_eq!(h.upstream_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.usage_rx.try_recv().unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn disabled_key_is_unauthorized() {
        let mut key = base_key();
        key.enabled = false;
        let mut h = harness(happy_upstream(), key).await;
        let response = call(&mut h, json!({"model": "gpt-4o"})).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["message"], "API key disabled");
    }

    #[tokio::test]
    async fn provider_failure_maps_to_502_and_records_usage() {
        let failing = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream broke") }),
        );
        let mut h = harness(failing, base_key()).await;

        let response = call(&mut h, json!({"model": "gpt-4o", "messages": []})).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let row = h.usage_rx.try_recv().unwrap();
        assert_eq!(row.status_code, 502);
        assert_eq!(row.input_tokens, 0);
        assert!(row.error_message.as_deref().unwrap_or_default().contains("500"));
        assert!(h.billing_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn streaming_passthrough_and_zero_cost_metering() {
        let streaming = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    [("content-type", "text/event-stream")],
                    "data: {\"delta\":\"hi\"}\n\ndata: {\"delta\":\" there\"}\n\ndata: [DONE]\n\n",
                )
            }),
        );
        let mut h = harness(streaming, base_key()).await;

        let response = call(&mut h, json!({"model": "gpt-4o", "stream": true})).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(
            text,
            "data: {\"delta\":\"hi\"}\n\ndata: {\"delta\":\" there\"}\n\ndata: [DONE]\n\n"
        );

        // One usage row with stream metadata and zero cost.
        let row = h.usage_rx.try_recv().unwrap();
        assert_eq!(row.endpoint, ENDPOINT_STREAM);
        assert_eq!(row.input_tokens, 0);
        assert_eq!(row.output_tokens, 0);
        assert!(h.billing_rx.try_recv().is_err(), "streaming bills zero");
    }

    #[test]
    fn stream_flag_is_lenient() {
        assert!(read_stream_flag(&json!({"stream": true})));
        assert!(!read_stream_flag(&json!({"stream": false})));
        assert!(read_stream_flag(&json!({"stream": 1})));
        assert!(!read_stream_flag(&json!({"stream": 0})));
        assert!(read_stream_flag(&json!({"stream": "true"})));
        assert!(read_stream_flag(&json!({"stream": "Yes"})));
        assert!(!read_stream_flag(&json!({"stream": "no"})));
        assert!(!read_stream_flag(&json!({})));
    }

    #[test]
    fn alias_overrides_merge_but_never_touch_model_or_stream() {
        let mut payload = json!({"model": "fast", "temperature": 0.9, "stream": false});
        apply_alias_overrides(
            &mut payload,
            &json!({"temperature": 0.1, "top_p": 0.5, "model": "evil", "stream": true}),
        );
        assert_eq!(payload["temperature"], 0.1);
        assert_eq!(payload["top_p"], 0.5);
        assert_eq!(payload["model"], "fast");
        assert_eq!(payload["stream"], false);
    }
}
