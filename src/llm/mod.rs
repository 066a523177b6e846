//! C2: LLM client (spec §4.10, §6 "LLM + embedding API").
//!
//! A `complete(messages, tools?, temperature, max_tokens) -> {content,
//! tool_calls}` contract over single-shot `agent.prompt(...)` calls. Only
//! the extractor's plain content-completion path (spec §4.3, the only
//! normative LLM usage) is wired against the real OpenAI provider; the
//! `tools` parameter is honored in full by the mock provider and passed as
//! additional context to the OpenAI agent, since rig-core's tool-calling
//! agent surface isn't exercised by this completion path.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{AppConfig, LlmProvider};
use crate::errors::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
    pub call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolSchema>>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError>;
}

/// Retry/backoff wrapper, mirroring the embedding client's
/// `fetch_with_retry` (spec §7b: retry `ExternalTransient` with backoff,
/// give up on everything else).
pub struct RetryingLlmClient<P> {
    provider: P,
    max_retries: u32,
    backoff: std::time::Duration,
}

impl<P: LlmClient> RetryingLlmClient<P> {
    pub fn new(provider: P, max_retries: u32, backoff: std::time::Duration) -> Self {
        Self { provider, max_retries, backoff }
    }
}

#[async_trait]
impl<P: LlmClient> LlmClient for RetryingLlmClient<P> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
        let mut attempt = 0;
        loop {
            let cloned = CompletionRequest {
                messages: request.messages.clone(),
                tools: request.tools.clone(),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
            };
            match self.provider.complete(cloned).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    warn!(attempt, error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Token-bucket throttle in front of a provider (spec §5 "Backpressure":
/// LLM calls are paced to `cfg.rate_limit_per_second` regardless of how many
/// pipeline workers are calling concurrently).
pub struct RateLimitedLlmClient<P> {
    provider: P,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl<P: LlmClient> RateLimitedLlmClient<P> {
    pub fn new(provider: P, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));
        Self { provider, limiter: RateLimiter::direct(Quota::per_second(rate)) }
    }
}

#[async_trait]
impl<P: LlmClient> LlmClient for RateLimitedLlmClient<P> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
        self.limiter.until_ready().await;
        self.provider.complete(request).await
    }
}

pub struct OpenAiLlmClient {
    model: String,
}

#[async_trait]
impl LlmClient for OpenAiLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();

        let preamble = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let user_turns = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut builder = client.agent(&self.model);
        if !preamble.is_empty() {
            builder = builder.preamble(&preamble);
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let tool_context = tools
                    .iter()
                    .map(|t| format!("- {} ({}): {}", t.name, t.description, t.parameters))
                    .collect::<Vec<_>>()
                    .join("\n");
                builder = builder.context(&format!("Available tools (describe any call as JSON, no execution):\n{tool_context}"));
            }
        }
        let agent = builder.build();

        let content = agent
            .prompt(user_turns.as_str())
            .await
            .map_err(|e| CoreError::ExternalTransient(format!("openai completion: {e}")))?;

        Ok(CompletionResponse { content, tool_calls: Vec::new() })
    }
}

/// Deterministic client for tests: echoes the last user message and, when
/// tools are offered, emits a tool call for the first one so extractor/
/// unification callers can exercise their tool-handling loop without a
/// network dependency.
pub struct MockLlmClient {
    pub fixed_content: Option<String>,
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
        if let Some(tools) = &request.tools {
            if let Some(first) = tools.first() {
                return Ok(CompletionResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall { name: first.name.clone(), args: serde_json::json!({}), call_id: "call_0".into() }],
                });
            }
        }
        let content = self
            .fixed_content
            .clone()
            .unwrap_or_else(|| request.messages.last().map(|m| m.content.clone()).unwrap_or_default());
        Ok(CompletionResponse { content, tool_calls: Vec::new() })
    }
}

pub fn build_llm_client(cfg: &AppConfig) -> Box<dyn LlmClient> {
    match cfg.llm_provider {
        LlmProvider::OpenAI => Box::new(RateLimitedLlmClient::new(
            RetryingLlmClient::new(OpenAiLlmClient { model: cfg.llm_chat_model.clone() }, cfg.llm_call_policy.max_retries, cfg.llm_error_backoff),
            cfg.rate_limit_per_second,
        )),
        ref other => {
            if !matches!(other, LlmProvider::Mock) {
                warn!(provider = ?other, "LLM provider not implemented, using mock");
            }
            Box::new(RateLimitedLlmClient::new(
                RetryingLlmClient::new(MockLlmClient { fixed_content: None }, cfg.llm_call_policy.max_retries, cfg.llm_error_backoff),
                cfg.rate_limit_per_second,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let client = MockLlmClient { fixed_content: None };
        let response = client
            .complete(CompletionRequest { messages: vec![Message::user("ping")], tools: None, temperature: 0.0, max_tokens: 100 })
            .await
            .unwrap();
        assert_eq!(response.content, "ping");
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn mock_emits_tool_call_when_tools_offered() {
        let client = MockLlmClient { fixed_content: None };
        let tools = vec![ToolSchema { name: "lookup".into(), description: "d".into(), parameters: serde_json::json!({}) }];
        let response = client
            .complete(CompletionRequest { messages: vec![Message::user("x")], tools: Some(tools), temperature: 0.0, max_tokens: 100 })
            .await
            .unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "lookup");
    }

    #[tokio::test]
    async fn retrying_client_retries_transient_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct FlakyOnce {
            calls: AtomicU32,
        }
        #[async_trait]
        impl LlmClient for FlakyOnce {
            async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CoreError::ExternalTransient("timeout".into()))
                } else {
                    Ok(CompletionResponse { content: "ok".into(), tool_calls: Vec::new() })
                }
            }
        }

        let client = RetryingLlmClient::new(FlakyOnce { calls: AtomicU32::new(0) }, 2, std::time::Duration::from_millis(1));
        let response = client
            .complete(CompletionRequest { messages: vec![Message::user("x")], tools: None, temperature: 0.0, max_tokens: 10 })
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn rate_limited_client_still_delegates_to_provider() {
        let client = RateLimitedLlmClient::new(MockLlmClient { fixed_content: Some("throttled".into()) }, 1000);
        let response = client
            .complete(CompletionRequest { messages: vec![Message::user("x")], tools: None, temperature: 0.0, max_tokens: 10 })
            .await
            .unwrap();
        assert_eq!(response.content, "throttled");
    }
}
