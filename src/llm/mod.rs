//! Transport client for the model provider.
//!
//! Every request is streamed (`stream: true`) so long generations never sit
//! on an idle connection. The pieces:
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `sse`     | Incremental SSE decoding and event accumulation             |
//! | `retry`   | Backoff policy for 429/529 responses, `Retry-After` parsing |
//! | `salvage` | Recovering complete `{path, content}` objects from cut JSON |
//! | `client`  | `AnthropicClient`, the reqwest-backed `CompletionProvider`  |

pub mod client;
pub mod retry;
pub mod salvage;
pub mod sse;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::LlmError;

pub use client::AnthropicClient;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_tool_use(id: &str, name: &str, input: Value) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
        }
    }

    /// A user turn reporting that the previous tool call was rejected.
    pub fn tool_error(tool_use_id: &str, message: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.to_string(),
                content: message.into(),
                is_error: true,
            }],
        }
    }
}

/// An append-only conversation. Extending returns a new value and leaves the
/// original untouched, so a retry loop can always fall back to the first turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conversation {
    messages: Arc<Vec<Message>>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(messages),
        }
    }

    pub fn single(message: Message) -> Self {
        Self::new(vec![message])
    }

    pub fn extended(&self, more: impl IntoIterator<Item = Message>) -> Self {
        let mut messages = self.messages.as_ref().clone();
        messages.extend(more);
        Self::new(messages)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Tool { name: String },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    MaxTokens,
    ProviderError,
}

impl StopReason {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "end_turn" | "stop_sequence" | "tool_use" | "pause_turn" => Self::Complete,
            "max_tokens" => Self::MaxTokens,
            _ => Self::ProviderError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::MaxTokens => "max_tokens",
            Self::ProviderError => "provider_error",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One model call. Tools are ignored by `complete_text`.
#[derive(Clone)]
pub struct CompletionRequest {
    pub api_key: String,
    pub model: String,
    pub system: String,
    pub conversation: Conversation,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
}

impl CompletionRequest {
    pub fn new(
        api_key: &str,
        model: &str,
        system: &str,
        conversation: Conversation,
        max_tokens: u32,
    ) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            system: system.to_string(),
            conversation,
            max_tokens,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    /// Force the model to answer by calling `tool`.
    pub fn with_required_tool(mut self, tool: ToolDefinition) -> Self {
        self.tool_choice = Some(ToolChoice::Tool {
            name: tool.name.clone(),
        });
        self.tools = vec![tool];
        self
    }
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("system_chars", &self.system.len())
            .field("messages", &self.conversation.len())
            .field("max_tokens", &self.max_tokens)
            .field("tools", &self.tools.iter().map(|t| &t.name).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextCompletion {
    pub text: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCompletion {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Parsed tool input. For a stream cut off at the token ceiling this
    /// holds only the records that could be recovered.
    pub input: Value,
    /// The accumulated JSON text exactly as streamed.
    pub raw_input: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

/// Abstraction over the model provider. Real implementation:
/// `AnthropicClient`. Test double: `testing::ScriptedProvider`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<TextCompletion, LlmError>;

    async fn complete_with_tool(
        &self,
        request: &CompletionRequest,
    ) -> Result<ToolCompletion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_extension_leaves_original_untouched() {
        let base = Conversation::single(Message::user("build it"));
        let next = base.extended([
            Message::assistant_tool_use("t1", "write_files", serde_json::json!({})),
            Message::tool_error("t1", "files: at least one file is required"),
        ]);
        assert_eq!(base.len(), 1);
        assert_eq!(next.len(), 3);
        assert_eq!(next.messages()[0], base.messages()[0]);
    }

    #[test]
    fn test_tool_result_serializes_error_flag_only_when_set() {
        let msg = Message::tool_error("t1", "bad");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["is_error"], true);

        let ok = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("is_error").is_none());
    }

    #[test]
    fn test_stop_reason_from_wire() {
        assert_eq!(StopReason::from_wire("end_turn"), StopReason::Complete);
        assert_eq!(StopReason::from_wire("tool_use"), StopReason::Complete);
        assert_eq!(StopReason::from_wire("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_wire("refusal"), StopReason::ProviderError);
    }

    #[test]
    fn test_request_debug_redacts_api_key() {
        let req = CompletionRequest::new(
            "sk-secret",
            "model",
            "system",
            Conversation::single(Message::user("hi")),
            100,
        );
        let debug = format!("{:?}", req);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_required_tool_sets_choice() {
        let tool = ToolDefinition {
            name: "write_files".into(),
            description: "d".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let req = CompletionRequest::new("k", "m", "s", Conversation::default(), 10)
            .with_required_tool(tool);
        assert_eq!(
            serde_json::to_value(req.tool_choice.as_ref().unwrap()).unwrap(),
            serde_json::json!({"type": "tool", "name": "write_files"})
        );
    }
}
