//! Validated code generation.
//!
//! The implementer must answer with one `write_files` tool call. The result is
//! checked against the file rules; a rejected call is fed back to the model as
//! a tool error and retried. Output cut off at the token ceiling is salvaged
//! instead of retried.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::step_runner::{Agent, RunContext, StageSettings, record_attempt};
use crate::errors::{LlmError, StepError};
use crate::llm::salvage::salvage_files;
use crate::llm::{
    CompletionProvider, CompletionRequest, Conversation, Message, StopReason, ToolDefinition,
};
use crate::pipeline::models::GeneratedFile;
use crate::store::AuditSink;

pub const WRITE_FILES_TOOL: &str = "write_files";

/// One initial attempt plus two retries.
pub const MAX_ATTEMPTS: u32 = 3;

pub fn write_files_tool() -> ToolDefinition {
    ToolDefinition {
        name: WRITE_FILES_TOOL.to_string(),
        description: "Write the complete set of files for the feature. Every file must be \
                      included in full; paths are relative to the repository root."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string", "minLength": 1 },
                            "content": { "type": "string", "minLength": 1 }
                        },
                        "required": ["path", "content"]
                    }
                }
            },
            "required": ["files"]
        }),
    }
}

/// A broken file rule, addressed by its field path (`files[2].path`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub rule: String,
}

impl Violation {
    fn new(field: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.rule)
    }
}

fn check_path(field: &str, path: &str, out: &mut Vec<Violation>) {
    if path.is_empty() {
        out.push(Violation::new(field, "must not be empty"));
        return;
    }
    if !path.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        out.push(Violation::new(field, "must start with a letter or digit"));
    }
    if path.contains('\\') {
        out.push(Violation::new(field, "must use '/' as the only separator"));
    }
    if path.contains([':', '\0']) {
        out.push(Violation::new(field, "must not contain ':' or NUL characters"));
    }
    // Segment rules match what the artifact store accepts as a key.
    let segments: Vec<&str> = path.split(['/', '\\']).collect();
    if segments.contains(&"..") {
        out.push(Violation::new(field, "must not contain '..' segments"));
    }
    if segments.contains(&".") {
        out.push(Violation::new(field, "must not contain '.' segments"));
    }
    if segments.iter().skip(1).any(|segment| segment.is_empty()) {
        out.push(Violation::new(
            field,
            "must not contain empty segments ('//') or end with '/'",
        ));
    }
}

/// Check one `{path, content}` record. `index` is used for field paths.
fn check_record(index: usize, record: &Value, out: &mut Vec<Violation>) -> Option<GeneratedFile> {
    let base = format!("files[{index}]");
    let Some(object) = record.as_object() else {
        out.push(Violation::new(base, "must be an object with path and content"));
        return None;
    };
    let before = out.len();

    let path_field = format!("{base}.path");
    let path = match object.get("path") {
        Some(Value::String(path)) => {
            check_path(&path_field, path, out);
            Some(path.as_str())
        }
        Some(_) => {
            out.push(Violation::new(path_field, "must be a string"));
            None
        }
        None => {
            out.push(Violation::new(path_field, "is required"));
            None
        }
    };

    let content_field = format!("{base}.content");
    let content = match object.get("content") {
        Some(Value::String(content)) if content.is_empty() => {
            out.push(Violation::new(content_field, "must not be empty"));
            None
        }
        Some(Value::String(content)) => Some(content.as_str()),
        Some(_) => {
            out.push(Violation::new(content_field, "must be a string"));
            None
        }
        None => {
            out.push(Violation::new(content_field, "is required"));
            None
        }
    };

    match (path, content) {
        (Some(path), Some(content)) if out.len() == before => {
            Some(GeneratedFile::new(path, content))
        }
        _ => None,
    }
}

/// Validate a full `write_files` input, collecting every violation.
pub fn validate_files(input: &Value) -> Result<Vec<GeneratedFile>, Vec<Violation>> {
    let Some(records) = input.get("files").and_then(Value::as_array) else {
        return Err(vec![Violation::new(
            "files",
            "must be an array of {path, content} objects",
        )]);
    };
    if records.is_empty() {
        return Err(vec![Violation::new("files", "at least one file is required")]);
    }

    let mut violations = Vec::new();
    let mut files = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        let Some(file) = check_record(index, record, &mut violations) else {
            continue;
        };
        if let Some(first) = seen.get(&file.path) {
            violations.push(Violation::new(
                format!("files[{index}].path"),
                format!("duplicates files[{first}].path ('{}')", file.path),
            ));
            continue;
        }
        seen.insert(file.path.clone(), index);
        files.push(file);
    }

    if violations.is_empty() {
        Ok(files)
    } else {
        Err(violations)
    }
}

/// The single feedback message sent back to the model.
pub fn feedback_message(violations: &[Violation]) -> String {
    let mut out = String::from("The write_files call was rejected:\n");
    for violation in violations {
        out.push_str(&format!("- {violation}\n"));
    }
    out.push_str("Fix every problem above and call write_files again with the complete file list.");
    out
}

/// Keep salvaged records that pass the per-file rules, first path wins.
fn filter_salvaged(files: Vec<GeneratedFile>) -> Vec<GeneratedFile> {
    let mut seen = std::collections::HashSet::new();
    files
        .into_iter()
        .enumerate()
        .filter(|(index, file)| {
            let mut violations = Vec::new();
            check_record(
                *index,
                &json!({ "path": file.path, "content": file.content }),
                &mut violations,
            );
            violations.is_empty() && seen.insert(file.path.clone())
        })
        .map(|(_, file)| file)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeOutput {
    pub files: Vec<GeneratedFile>,
    pub was_truncated: bool,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct CodeRunner {
    provider: Arc<dyn CompletionProvider>,
    audit: Arc<dyn AuditSink>,
    max_attempts: u32,
}

impl CodeRunner {
    pub fn new(provider: Arc<dyn CompletionProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            provider,
            audit,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub async fn generate(
        &self,
        ctx: &RunContext,
        system: &str,
        prompt: String,
        stage: &StageSettings,
    ) -> Result<CodeOutput, StepError> {
        let base = Conversation::single(Message::user(prompt));
        let mut conversation = base.clone();
        let mut last_error = String::new();
        let mut truncations = 0;

        for attempt in 1..=self.max_attempts {
            let request = CompletionRequest::new(
                &ctx.api_key,
                &stage.model,
                system,
                conversation.clone(),
                stage.max_tokens,
            )
            .with_required_tool(write_files_tool());

            let completion = match self.provider.complete_with_tool(&request).await {
                Ok(completion) => completion,
                Err(LlmError::Truncated) => {
                    self.audit_failure(ctx, attempt, &LlmError::Truncated.to_string())
                        .await;
                    warn!(job_id = %ctx.job_id, attempt, "tool output truncated beyond recovery, starting over");
                    truncations += 1;
                    let which = if truncations == attempt {
                        format!("on every attempt ({attempt})")
                    } else {
                        format!("on attempt {attempt} of {}", self.max_attempts)
                    };
                    last_error = format!(
                        "The model hit its output limit {which} before finishing a single file. \
                         Simplify the request or split it into smaller features."
                    );
                    conversation = base.clone();
                    continue;
                }
                Err(err) => {
                    self.audit_failure(ctx, attempt, &err.to_string()).await;
                    return Err(err.into());
                }
            };

            if completion.stop_reason == StopReason::MaxTokens {
                let recovered = filter_salvaged(
                    salvage_files(&completion.raw_input).unwrap_or_default(),
                );
                info!(
                    job_id = %ctx.job_id,
                    attempt,
                    recovered = recovered.len(),
                    "salvaged truncated implementation"
                );
                if recovered.is_empty() {
                    let message = "The model hit its output limit before finishing any file. \
                                   Simplify the request or split it into smaller features, then retry.";
                    self.audit_failure(ctx, attempt, message).await;
                    return Err(StepError::Generation(message.to_string()));
                }
                record_attempt(
                    self.audit.as_ref(),
                    ctx,
                    Agent::Implementer,
                    attempt,
                    Ok((completion.usage, completion.stop_reason)),
                )
                .await;
                return Ok(CodeOutput {
                    files: recovered,
                    was_truncated: true,
                    attempts: attempt,
                });
            }

            match validate_files(&completion.input) {
                Ok(files) => {
                    record_attempt(
                        self.audit.as_ref(),
                        ctx,
                        Agent::Implementer,
                        attempt,
                        Ok((completion.usage, completion.stop_reason)),
                    )
                    .await;
                    info!(job_id = %ctx.job_id, attempt, files = files.len(), "implementation validated");
                    return Ok(CodeOutput {
                        files,
                        was_truncated: false,
                        attempts: attempt,
                    });
                }
                Err(violations) => {
                    let feedback = feedback_message(&violations);
                    self.audit_failure(ctx, attempt, &feedback).await;
                    warn!(
                        job_id = %ctx.job_id,
                        attempt,
                        violations = violations.len(),
                        "generated files failed validation"
                    );
                    last_error = format!(
                        "The generated files failed validation after {attempt} attempts: {}",
                        violations
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join("; ")
                    );
                    conversation = conversation.extended([
                        Message::assistant_tool_use(
                            &completion.tool_use_id,
                            &completion.tool_name,
                            completion.input,
                        ),
                        Message::tool_error(&completion.tool_use_id, feedback),
                    ]);
                }
            }
        }

        Err(StepError::Generation(last_error))
    }

    async fn audit_failure(&self, ctx: &RunContext, attempt: u32, message: &str) {
        record_attempt(
            self.audit.as_ref(),
            ctx,
            Agent::Implementer,
            attempt,
            Err(message),
        )
        .await;
    }
}
