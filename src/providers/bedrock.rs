//! Bedrock provider.
//!
//! Uses the Bedrock runtime's OpenAI-compatible chat-completions surface with
//! a long-lived Bedrock API key as the bearer credential. The region comes
//! from the provider config; `base_url` overrides the derived endpoint.

use std::time::Duration;

use reqwest::Client;
use uuid::Uuid;

use super::openai::{build_clients, check_models_endpoint, send_chat};
use super::{ChatOutcome, ChatRequest, ProviderConfig, ProviderError};

const DEFAULT_REGION: &str = "us-east-1";

pub struct BedrockProvider {
    id: Uuid,
    name: String,
    base_url: String,
    api_key: String,
    buffered: Client,
    streaming: Client,
}

impl BedrockProvider {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = config
            .credentials
            .get("api_key")
            .ok_or_else(|| ProviderError::Config("missing api_key credential".to_string()))?
            .to_string();

        let base_url = match config.config.get("base_url") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let region = config
                    .config
                    .get("region")
                    .map(|s| s.as_str())
                    .unwrap_or(DEFAULT_REGION);
                format!("https://bedrock-runtime.{region}.amazonaws.com/openai/v1")
            }
        };

        let (buffered, streaming) = build_clients(request_timeout)?;
        Ok(BedrockProvider {
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
