//! OpenAI provider: the reference implementation of the provider contract.
//!
//! Also home of the shared OpenAI-compatible wire helpers that the Vertex AI
//! and Bedrock variants reuse: both expose the same `/chat/completions`
//! surface and differ only in base URL and credential material.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

use crate::pricing::UsageReport;

use super::{ChatOutcome, ChatRequest, ChatResponse, ChatStream, ProviderConfig, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ERROR_BODY_LIMIT: usize = 500;

pub struct OpenAiProvider {
    id: Uuid,
    name: String,
    base_url: String,
    api_key: String,
    buffered: Client,
    streaming: Client,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = config
            .credentials
            .get("api_key")
            .ok_or_else(|| ProviderError::Config("missing api_key credential".to_string()))?
            .to_string();
        let base_url = config
            .config
            .get("base_url")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let (buffered, streaming) = build_clients(request_timeout)?;

        Ok(OpenAiProvider {
            id: config.id,
            name: config.name,
            base_url,
            api_key,
            buffered,
            streaming,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
        send_chat(
            &self.buffered,
            &self.streaming,
            &self.base_url,
            &self.api_key,
            request,
        )
        .await
    }

    pub async fn validate_credentials(&self) -> Result<(), ProviderError> {
        check_models_endpoint(&self.buffered, &self.base_url, &self.api_key).await
    }
}

/// Build the per-provider HTTP clients. The buffered client carries the
/// configured request deadline; the streaming client has no total timeout
/// because SSE responses are open-ended.
pub(crate) fn build_clients(request_timeout: Duration) -> Result<(Client, Client), ProviderError> {
    let buffered = Client::builder()
        .timeout(request_timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;
    let streaming = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;
    Ok((buffered, streaming))
}

/// POST an OpenAI-shaped chat request to `{base_url}/chat/completions`.
pub(crate) async fn send_chat(
    buffered: &Client,
    streaming: &Client,
    base_url: &str,
    bearer: &str,
    request: ChatRequest,
) -> Result<ChatOutcome, ProviderError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let stream = request.stream;
    let body = prepare_payload(request);

    if stream {
        let response = streaming
            .post(&url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(upstream_error(status.as_u16(), &text));
        }
        return Ok(ChatOutcome::Streaming(ChatStream {
            status: status.as_u16(),
            response,
        }));
    }

    let response = buffered
        .post(&url)
        .bearer_auth(bearer)
        .json(&body)
        .send()
        .await?;

    let status = response.status().as_u16();
    let text = response.text().await?;
    if !(200..300).contains(&status) {
        return Err(upstream_error(status, &text));
    }

    let body: Value = serde_json::from_str(&text)
        .map_err(|e| ProviderError::Request(format!("unparseable upstream response: {e}")))?;
    let usage = usage_from_response(&body);

    Ok(ChatOutcome::Buffered(ChatResponse {
        status,
        body,
        usage,
    }))
}

/// Credential probe against `{base_url}/models`.
pub(crate) async fn check_models_endpoint(
    client: &Client,
    base_url: &str,
    bearer: &str,
) -> Result<(), ProviderError> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let response = client.get(&url).bearer_auth(bearer).send().await?;
    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(ProviderError::Credentials(format!(
            "upstream rejected credentials with {status}"
        )));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(upstream_error(status.as_u16(), &text));
    }
    Ok(())
}

/// The client payload passes through opaquely; only `model` and `stream` are
/// rewritten.
fn prepare_payload(request: ChatRequest) -> Value {
    let ChatRequest {
        model,
        mut payload,
        stream,
    } = request;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model));
        if stream || obj.contains_key("stream") {
            obj.insert("stream".to_string(), Value::Bool(stream));
        }
    }
    payload
}

fn upstream_error(status: u16, body: &str) -> ProviderError {
    let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    ProviderError::UpstreamStatus {
        status,
        body: snippet,
    }
}

/// Extract the token breakdown from an OpenAI-shaped `usage` object.
pub fn usage_from_response(body: &Value) -> UsageReport {
    let Some(usage) = body.get("usage") else {
        return UsageReport::default();
    };

    let int = |v: &Value, key: &str| v.get(key).and_then(Value::as_i64).unwrap_or(0);

    let input_tokens = int(usage, "prompt_tokens");
    let output_tokens = int(usage, "completion_tokens");
    let cached_tokens = usage
        .get("prompt_tokens_details")
        .map(|d| int(d, "cached_tokens"))
        .unwrap_or(0);
    let reasoning_tokens = usage
        .get("completion_tokens_details")
        .map(|d| int(d, "reasoning_tokens"))
        .unwrap_or(0);
    let total_tokens = match int(usage, "total_tokens") {
        0 => input_tokens + output_tokens,
        total => total,
    };

    UsageReport {
        input_tokens,
        output_tokens,
        cached_tokens,
        reasoning_tokens,
        total_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Credentials;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn spawn_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/v1")
    }

    fn provider(base_url: &str) -> OpenAiProvider {
        let mut creds = HashMap::new();
        creds.insert("api_key".to_string(), "sk-upstream".to_string());
        let mut config = HashMap::new();
        config.insert("base_url".to_string(), base_url.to_string());
        OpenAiProvider::new(
            ProviderConfig {
                id: Uuid::new_v4(),
                name: "openai-test".to_string(),
                kind: crate::providers::ProviderKind::OpenAi,
                credentials: Credentials::from_map(creds),
                config,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn buffered_chat_passes_through_and_extracts_usage() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({
                    "id": "chatcmpl-1",
                    "echo_model": body["model"],
                    "echo_auth": auth,
                    "echo_temperature": body["temperature"],
                    "usage": {
                        "prompt_tokens": 1000,
                        "completion_tokens": 500,
                        "total_tokens": 1500,
                        "prompt_tokens_details": {"cached_tokens": 128},
                        "completion_tokens_details": {"reasoning_tokens": 7}
                    }
                }))
            }),
        );
        let base = spawn_upstream(app).await;
        let provider = provider(&base);

        let outcome = provider
            .chat(ChatRequest {
                model: "gpt-4o".to_string(),
                payload: json!({"model": "fast", "messages": [], "temperature": 0.2}),
                stream: false,
            })
            .await
            .unwrap();

        let ChatOutcome::Buffered(response) = outcome else {
            panic!("expected buffered response");
        };
        assert_eq!(response.status, 200);
        // Model was rewritten to the resolved name, the rest passed through.
        assert_eq!(response.body["echo_model"], "gpt-4o");
        assert_eq!(response.body["echo_auth"], "Bearer sk-upstream");
        assert_eq!(response.body["echo_temperature"], 0.2);
        assert_eq!(response.usage.input_tokens, 1000);
        assert_eq!(response.usage.output_tokens, 500);
        assert_eq!(response.usage.cached_tokens, 128);
        assert_eq!(response.usage.reasoning_tokens, 7);
        assert_eq!(response.usage.total_tokens, 1500);
    }

    #[tokio::test]
    async fn upstream_error_status_is_reported() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": {"message": "slow down"}})),
                )
            }),
        );
        let base = spawn_upstream(app).await;
        let provider = provider(&base);

        let err = provider
            .chat(ChatRequest {
                model: "gpt-4o".to_string(),
                payload: json!({"messages": []}),
                stream: false,
            })
            .await
            .unwrap_err();

        match err {
            ProviderError::UpstreamStatus { status, body } => {
                assert_eq!(status, 429);
                assert!(body.contains("slow down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_chat_returns_raw_byte_stream() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    [("content-type", "text/event-stream")],
                    Body::from("data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n"),
                )
                    .into_response()
            }),
        );
        let base = spawn_upstream(app).await;
        let provider = provider(&base);

        let outcome = provider
            .chat(ChatRequest {
                model: "gpt-4o".to_string(),
                payload: json!({"messages": []}),
                stream: true,
            })
            .await
            .unwrap();

        let ChatOutcome::Streaming(stream) = outcome else {
            panic!("expected streaming response");
        };
        assert_eq!(stream.status, 200);
        let bytes = stream.response.bytes().await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("data: {\"delta\":\"hi\"}"));
        assert!(text.contains("data: [DONE]"));
    }

    #[tokio::test]
    async fn validate_credentials_maps_auth_failures() {
        let ok = Router::new().route("/v1/models", get(|| async { Json(json!({"data": []})) }));
        let base = spawn_upstream(ok).await;
        assert!(provider(&base).validate_credentials().await.is_ok());

        let denied = Router::new().route(
            "/v1/models",
            get(|| async { (StatusCode::UNAUTHORIZED, "nope") }),
        );
        let base = spawn_upstream(denied).await;
        let err = provider(&base).validate_credentials().await.unwrap_err();
        assert!(matches!(err, ProviderError::Credentials(_)));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let result = OpenAiProvider::new(
            ProviderConfig {
                id: Uuid::new_v4(),
                name: "openai".to_string(),
                kind: crate::providers::ProviderKind::OpenAi,
                credentials: Credentials::default(),
                config: HashMap::new(),
            },
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[test]
    fn usage_extraction_handles_missing_fields() {
        assert!(usage_from_response(&json!({})).is_empty());

        let usage = usage_from_response(&json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        }));
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 4);
        assert_eq!(usage.total_tokens, 14);
        assert_eq!(usage.cached_tokens, 0);
    }
}
