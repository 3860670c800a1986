//! Upstream provider implementations.
//!
//! Providers form a tagged union behind a small capability set: `chat`,
//! `validate_credentials`, `close`. The registry owns the live instances and
//! swaps them atomically on reload; request handlers hold `Arc` clones for
//! the duration of one call.
//!
//! The OpenAI variant is the reference implementation. Vertex AI and Bedrock
//! speak through their OpenAI-compatible chat-completions surfaces and differ
//! only in URL construction and credential material.

pub mod bedrock;
pub mod openai;
pub mod vertexai;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::pricing::UsageReport;

/// Closed set of supported provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    VertexAi,
    Bedrock,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "vertexai" | "vertex_ai" => Some(ProviderKind::VertexAi),
            "bedrock" => Some(ProviderKind::Bedrock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::VertexAi => "vertexai",
            ProviderKind::Bedrock => "bedrock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decrypted credential bundle. Keys are provider-specific ("api_key",
/// "access_token", ...).
#[derive(Clone, Default)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Credentials(serde_json::from_slice(bytes)?))
    }

    pub fn from_map(map: HashMap<String, String>) -> Self {
        Credentials(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}

// Secrets must never reach logs through a stray {:?}.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(<{} redacted fields>)", self.0.len())
    }
}

/// A configured upstream, as loaded by the registry.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: Uuid,
    pub name: String,
    pub kind: ProviderKind,
    pub credentials: Credentials,
    pub config: HashMap<String, String>,
}

/// One chat call to an upstream. `payload` is the client body passed through
/// opaquely; only `model` and `stream` are overridden.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub payload: Value,
    pub stream: bool,
}

/// Buffered upstream response.
#[derive(Debug)]
pub struct ChatResponse {
    pub status: u16,
    pub body: Value,
    pub usage: UsageReport,
}

/// Streaming upstream response; the body is consumed by the SSE framer.
#[derive(Debug)]
pub struct ChatStream {
    pub status: u16,
    pub response: reqwest::Response,
}

#[derive(Debug)]
pub enum ChatOutcome {
    Buffered(ChatResponse),
    Streaming(ChatStream),
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("provider misconfigured: {0}")]
    Config(String),
    #[error("provider credentials rejected: {0}")]
    Credentials(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Request(e.to_string())
        }
    }
}

/// Tagged union over the live provider variants.
pub enum ChatProvider {
    OpenAi(openai::OpenAiProvider),
    VertexAi(vertexai::VertexAiProvider),
    Bedrock(bedrock::BedrockProvider),
}

impl ChatProvider {
    pub fn from_config(
        config: ProviderConfig,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        match config.kind {
            ProviderKind::OpenAi => Ok(ChatProvider::OpenAi(openai::OpenAiProvider::new(
                config,
                request_timeout,
            )?)),
            ProviderKind::VertexAi => Ok(ChatProvider::VertexAi(vertexai::VertexAiProvider::new(
                config,
                request_timeout,
            )?)),
            ProviderKind::Bedrock => Ok(ChatProvider::Bedrock(bedrock::BedrockProvider::new(
                config,
                request_timeout,
            )?)),
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ChatProvider::OpenAi(p) => p.id(),
            ChatProvider::VertexAi(p) => p.id(),
            ChatProvider::Bedrock(p) => p.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ChatProvider::OpenAi(p) => p.name(),
            ChatProvider::VertexAi(p) => p.name(),
            ChatProvider::Bedrock(p) => p.name(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ChatProvider::OpenAi(_) => ProviderKind::OpenAi,
            ChatProvider::VertexAi(_) => ProviderKind::VertexAi,
            ChatProvider::Bedrock(_) => ProviderKind::Bedrock,
        }
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ProviderError> {
        match self {
            ChatProvider::OpenAi(p) => p.chat(request).await,
            ChatProvider::VertexAi(p) => p.chat(request).await,
            ChatProvider::Bedrock(p) => p.chat(request).await,
        }
    }

    pub async fn validate_credentials(&self) -> Result<(), ProviderError> {
        match self {
            ChatProvider::OpenAi(p) => p.validate_credentials().await,
            ChatProvider::VertexAi(p) => p.validate_credentials().await,
            ChatProvider::Bedrock(p) => p.validate_credentials().await,
        }
    }

    /// Release the variant's resources. Dropping the HTTP clients closes
    /// their idle connections; in-flight requests hold their own handles.
    pub fn close(&self) {
        tracing::debug!(provider = %self.name(), "closing provider");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parsing() {
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("VertexAI"), Some(ProviderKind::VertexAi));
        assert_eq!(ProviderKind::parse("bedrock"), Some(ProviderKind::Bedrock));
        assert_eq!(ProviderKind::parse("azure"), None);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let mut map = HashMap::new();
        map.insert("api_key".to_string(), "sk-very-secret".to_string());
        let creds = Credentials::from_map(map);
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("sk-very-secret"));
    }

    #[test]
    fn credentials_empty_values_read_as_absent() {
        let mut map = HashMap::new();
        map.insert("api_key".to_string(), String::new());
        let creds = Credentials::from_map(map);
        assert_eq!(creds.get("api_key"), None);
    }
}
