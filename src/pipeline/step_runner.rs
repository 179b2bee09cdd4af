use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::errors::LlmError;
use crate::llm::{CompletionProvider, CompletionRequest, Conversation, Message, StopReason, Usage};
use crate::store::{AuditEntry, AuditSink};

/// Which role a model call plays. Each agent has its own system prompt and
/// stage settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Agent {
    Spec,
    Plan,
    Tests,
    Implementer,
    SecurityReviewer,
    CodeReviewer,
    Alignment,
}

impl Agent {
    pub const ALL: [Agent; 7] = [
        Self::Spec,
        Self::Plan,
        Self::Tests,
        Self::Implementer,
        Self::SecurityReviewer,
        Self::CodeReviewer,
        Self::Alignment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Plan => "plan",
            Self::Tests => "tests",
            Self::Implementer => "implement",
            Self::SecurityReviewer => "security_review",
            Self::CodeReviewer => "code_review",
            Self::Alignment => "alignment",
        }
    }

    pub fn default_max_tokens(&self) -> u32 {
        match self {
            Self::Implementer => 32_000,
            Self::Alignment => 2_048,
            _ => 8_192,
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSettings {
    pub model: String,
    pub max_tokens: u32,
}

/// Model and token ceiling for every agent, with a shared default model.
#[derive(Debug, Clone)]
pub struct StageTable {
    default_model: String,
    stages: HashMap<Agent, StageSettings>,
}

impl StageTable {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            stages: HashMap::new(),
        }
    }

    pub fn with(mut self, agent: Agent, max_tokens: u32, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| self.default_model.clone());
        self.stages.insert(agent, StageSettings { model, max_tokens });
        self
    }

    pub fn get(&self, agent: Agent) -> StageSettings {
        self.stages.get(&agent).cloned().unwrap_or_else(|| StageSettings {
            model: self.default_model.clone(),
            max_tokens: agent.default_max_tokens(),
        })
    }
}

/// Identifies the job and credential a model call runs on behalf of.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    pub owner_id: String,
    pub api_key: String,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("job_id", &self.job_id)
            .field("owner_id", &self.owner_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub text: String,
    pub usage: Usage,
    pub was_truncated: bool,
}

/// Write one audit entry. A failing sink is logged and otherwise ignored.
pub(crate) async fn record_attempt(
    audit: &dyn AuditSink,
    ctx: &RunContext,
    agent: Agent,
    attempt: u32,
    outcome: Result<(Usage, StopReason), &str>,
) {
    let (success, usage, stop_reason, error) = match outcome {
        Ok((usage, stop)) => (true, usage, Some(stop.as_str().to_string()), None),
        Err(message) => (false, Usage::default(), None, Some(message.to_string())),
    };
    let entry = AuditEntry {
        job_id: ctx.job_id.clone(),
        owner_id: ctx.owner_id.clone(),
        agent: agent.as_str().to_string(),
        attempt,
        success,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        stop_reason,
        error,
        created_at: Utc::now(),
    };
    if let Err(err) = audit.record(entry).await {
        warn!(job_id = %ctx.job_id, agent = %agent, error = %err, "failed to write audit entry");
    }
}

/// Runs single free-text model calls.
#[derive(Clone)]
pub struct StepRunner {
    provider: Arc<dyn CompletionProvider>,
    audit: Arc<dyn AuditSink>,
}

impl StepRunner {
    pub fn new(provider: Arc<dyn CompletionProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self { provider, audit }
    }

    pub async fn run(
        &self,
        ctx: &RunContext,
        agent: Agent,
        system: &str,
        prompt: String,
        stage: &StageSettings,
    ) -> Result<StepOutput, LlmError> {
        let request = CompletionRequest::new(
            &ctx.api_key,
            &stage.model,
            system,
            Conversation::single(Message::user(prompt)),
            stage.max_tokens,
        );

        match self.provider.complete_text(&request).await {
            Ok(completion) => {
                record_attempt(
                    self.audit.as_ref(),
                    ctx,
                    agent,
                    1,
                    Ok((completion.usage, completion.stop_reason)),
                )
                .await;
                let was_truncated = completion.stop_reason == StopReason::MaxTokens;
                info!(
                    job_id = %ctx.job_id,
                    agent = %agent,
                    output_tokens = completion.usage.output_tokens,
                    was_truncated,
                    "model call finished"
                );
                Ok(StepOutput {
                    text: completion.text,
                    usage: completion.usage,
                    was_truncated,
                })
            }
            Err(err) => {
                record_attempt(self.audit.as_ref(), ctx, agent, 1, Err(&err.to_string())).await;
                warn!(job_id = %ctx.job_id, agent = %agent, error = %err, "model call failed");
                Err(err)
            }
        }
    }
}
