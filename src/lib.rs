//! Multi-tenant LLM gateway.
//!
//! One OpenAI-compatible chat-completions endpoint in front of several
//! upstream model providers. Requests authenticate with gateway-issued API
//! keys, pass rate-limit and budget policy, and are forwarded (buffered or
//! streamed) to the provider resolved from the model catalogue; usage and
//! billing are persisted asynchronously.

pub mod billing;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod keys;
pub mod limiter;
pub mod pricing;
pub mod providers;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod server;
