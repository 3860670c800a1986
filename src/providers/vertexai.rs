//! Vertex AI provider.
//!
//! Speaks through Vertex AI's OpenAI-compatible endpoint. The credential
//! bundle carries a pre-minted `access_token` (token refresh is the admin
//! plane's job); `project_id` and `location` come from the provider config,
//! or an explicit `base_url` overrides the derived endpoint entirely.

use std::time::Duration;

use reqwest::Client;
use uuid::Uuid;

use super::openai::{build_clients, check_models_endpoint, send_chat};
use super::{ChatOutcome, ChatRequest, ProviderConfig, ProviderError};

const DEFAULT_LOCATION: &str = "us-central1";

pub struct VertexAiProvider {
    id: Uuid,
    name: String,
    base_url: String,
    access_token: String,
    buffered: Client,
    streaming: Client,
}

impl VertexAiProvider {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Result<Self, ProviderError> {
        let access_token = config
            .credentials
            .get("access_token")
            .or_else(|| config.credentials.get("api_key"))
            .ok_or_else(|| ProviderError::Config("missing access_token credential".to_string()))?
            .to_string();

        let base_url = match config.config.get("base_url") {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let project = config.config.get("project_id").ok_or_else(|| {
                    ProviderError::Config("missing project_id (or base_url) in config".to_string())
                })?;
                let location = config
                    .config
                    .get("location")
                    .map(|s| s.as_str())
                    .unwrap_or(DEFAULT_LOCATION);
                format!(
                    "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/endpoints/openapi"
                )
            }
        };

        let (buffered, streaming) = build_clients(request_timeout)?;
        Ok(VertexAiProvider {
            id: config.id,
            name: config.name,
            base_url,
            access_token,
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
            &self.access_token,
            request,
        )
        .await
    }

    pub async fn validate_credentials(&self) -> Result<(), ProviderError> {
        check_models_endpoint(&self.buffered, &self.base_url, &self.access_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Credentials, ProviderKind};
    use std::collections::HashMap;

    fn config(
        creds: &[(&str, &str)],
        cfg: &[(&str, &str)],
    ) -> ProviderConfig {
        ProviderConfig {
            id: Uuid::new_v4(),
            name: "vertex".to_string(),
            kind: ProviderKind::VertexAi,
            credentials: Credentials::from_map(
                creds
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            config: cfg
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn derives_endpoint_from_project_and_location() {
        let provider = VertexAiProvider::new(
            config(
                &[("access_token", "ya29.token")],
                &[("project_id", "acme-prod"), ("location", "europe-west4")],
            ),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            provider.base_url,
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/acme-prod/locations/europe-west4/endpoints/openapi"
        );
    }

    #[test]
    fn explicit_base_url_wins() {
        let provider = VertexAiProvider::new(
            config(
                &[("access_token", "ya29.token")],
                &[("base_url", "http://127.0.0.1:9999/v1/")],
            ),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(provider.base_url, "http://127.0.0.1:9999/v1");
    }

    #[test]
    fn missing_project_and_base_url_is_config_error() {
        let result = VertexAiProvider::new(
            config(&[("access_token", "ya29.token")], &[]),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }
}
