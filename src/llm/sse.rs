//! Server-sent event reassembly for the streaming messages endpoint.
//!
//! `SseDecoder` turns arbitrary network chunks into complete events. Chunks
//! may split a multi-byte character or an event in half; both are buffered
//! until the rest arrives. `StreamAccumulator` folds the decoded events into
//! a text or tool-call result.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::salvage::salvage_files;
use super::{StopReason, TextCompletion, ToolCompletion, Usage};
use crate::errors::LlmError;

/// One decoded `event:`/`data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes that do not yet form a complete UTF-8 sequence.
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a blank line.
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk, returning every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        self.decode_pending();
        self.drain_events()
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&rest);
        }
        let mut events = self.drain_events();
        let tail = std::mem::take(&mut self.buffer);
        if let Some(event) = parse_block(&tail) {
            events.push(event);
        }
        events
    }

    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn drain_events(&mut self) -> Vec<SseEvent> {
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Option<String> = None;
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    data.map(|data| SseEvent { event, data })
}

// ── Provider event payloads ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        content_block: BlockStart,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    Error {
        error: WireError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockStart {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Folds stream events into a completion.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    tool_use_id: Option<String>,
    tool_name: Option<String>,
    tool_json: String,
    usage: Usage,
    stop_reason: Option<String>,
    error: Option<String>,
    skipped: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events that could not be parsed and were ignored.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn apply(&mut self, event: &SseEvent) {
        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.skipped += 1;
                debug!(event = ?event.event, error = %err, "skipping unparseable stream event");
                return;
            }
        };
        match parsed {
            StreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.merge_usage(&usage);
                }
            }
            StreamEvent::ContentBlockStart {
                content_block: BlockStart::ToolUse { id, name },
            } => {
                // Only the first tool call is kept; the pipeline always forces one tool.
                if self.tool_use_id.is_none() {
                    self.tool_use_id = Some(id);
                    self.tool_name = Some(name);
                }
            }
            StreamEvent::ContentBlockStart { .. } => {}
            StreamEvent::ContentBlockDelta { delta } => match delta {
                Delta::TextDelta { text } => self.text.push_str(&text),
                Delta::InputJsonDelta { partial_json } => self.tool_json.push_str(&partial_json),
                Delta::Other => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }
            }
            StreamEvent::Error { error } => {
                let kind = error.kind.unwrap_or_else(|| "error".to_string());
                let message = error.message.unwrap_or_else(|| "no details".to_string());
                self.error = Some(format!("{kind}: {message}"));
            }
            StreamEvent::Other => {}
        }
    }

    fn merge_usage(&mut self, usage: &WireUsage) {
        if let Some(input) = usage.input_tokens {
            self.usage.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.usage.output_tokens = output;
        }
    }

    fn stop_reason(&self) -> Result<StopReason, LlmError> {
        if let Some(error) = &self.error {
            return Err(LlmError::Stream(error.clone()));
        }
        let raw = self.stop_reason.as_deref().ok_or_else(|| {
            LlmError::Malformed("the stream ended before the model finished".to_string())
        })?;
        match StopReason::from_wire(raw) {
            StopReason::ProviderError => Err(LlmError::Stream(format!(
                "the model stopped unexpectedly ({raw})"
            ))),
            reason => Ok(reason),
        }
    }

    pub fn into_text(self) -> Result<TextCompletion, LlmError> {
        let stop_reason = self.stop_reason()?;
        Ok(TextCompletion {
            text: self.text,
            usage: self.usage,
            stop_reason,
        })
    }

    /// Parse the accumulated tool input. A stream cut off at the token ceiling
    /// is salvaged before giving up.
    pub fn into_tool(self) -> Result<ToolCompletion, LlmError> {
        let stop_reason = self.stop_reason()?;
        let (Some(tool_use_id), Some(tool_name)) = (self.tool_use_id, self.tool_name) else {
            return Err(match stop_reason {
                StopReason::MaxTokens => LlmError::Truncated,
                _ => LlmError::Malformed("the model did not call the requested tool".to_string()),
            });
        };

        let raw_input = self.tool_json;
        let parsed = if raw_input.trim().is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(&raw_input)
        };

        let input = match parsed {
            Ok(value) => value,
            Err(err) if stop_reason == StopReason::MaxTokens => match salvage_files(&raw_input) {
                Some(files) => {
                    debug!(recovered = files.len(), error = %err, "salvaged truncated tool input");
                    serde_json::json!({ "files": files })
                }
                None => return Err(LlmError::Truncated),
            },
            Err(err) => {
                return Err(LlmError::Malformed(format!(
                    "tool input was not valid JSON: {err}"
                )));
            }
        };

        Ok(ToolCompletion {
            tool_use_id,
            tool_name,
            input,
            raw_input,
            usage: self.usage,
            stop_reason,
        })
    }
}
