use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::sse::{SseDecoder, StreamAccumulator};
use super::{
    CompletionProvider, CompletionRequest, Message, RetryPolicy, TextCompletion, ToolChoice,
    ToolCompletion, ToolDefinition,
};
use crate::errors::LlmError;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Streaming client for the `/v1/messages` endpoint.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    system: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a ToolChoice>,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

impl AnthropicClient {
    pub fn new(base_url: &str, api_version: &str, retry: RetryPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            retry,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    /// Send the request, retrying 429/529 responses per the policy. Once the
    /// attempts are used up the last response is returned for the caller to
    /// classify.
    async fn send_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, LlmError> {
        let body = WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            stream: true,
            system: &request.system,
            messages: request.conversation.messages(),
            tools: &request.tools,
            tool_choice: request.tool_choice.as_ref(),
        };

        let mut attempt = 1;
        loop {
            let response = self
                .http
                .post(self.endpoint())
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", &self.api_version)
                .json(&body)
                .send()
                .await
                .map_err(|e| LlmError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            if !RetryPolicy::is_retryable(status) || attempt >= self.retry.max_attempts {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            let delay = self.retry.delay_for(attempt, retry_after);
            warn!(
                status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "model provider busy, retrying"
            );
            drop(response);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<StreamAccumulator, LlmError> {
        let response = self.send_with_retry(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status.as_u16(), &body));
        }

        let mut decoder = SseDecoder::new();
        let mut accumulator = StreamAccumulator::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
            for event in decoder.push(&chunk) {
                accumulator.apply(&event);
            }
        }
        for event in decoder.finish() {
            accumulator.apply(&event);
        }
        if accumulator.skipped() > 0 {
            debug!(skipped = accumulator.skipped(), "ignored unparseable stream events");
        }
        Ok(accumulator)
    }
}

/// Map a non-2xx response to a user-facing error.
pub fn map_http_error(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no details".to_string()
            } else {
                trimmed.chars().take(300).collect()
            }
        });
    match status {
        401 => LlmError::InvalidCredential,
        429 | 529 => LlmError::Overloaded { status },
        400 => LlmError::BadRequest { message },
        _ => LlmError::Http { status, message },
    }
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<TextCompletion, LlmError> {
        self.stream(request).await?.into_text()
    }

    async fn complete_with_tool(
        &self,
        request: &CompletionRequest,
    ) -> Result<ToolCompletion, LlmError> {
        self.stream(request).await?.into_tool()
    }
}
