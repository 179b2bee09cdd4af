//! In-memory collaborators and a scripted model provider.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::errors::{LlmError, StoreError};
use crate::llm::{
    CompletionProvider, CompletionRequest, StopReason, TextCompletion, ToolCompletion, Usage,
};
use crate::llm::salvage::salvage_files;
use crate::pipeline::code_runner::WRITE_FILES_TOOL;
use crate::pipeline::models::{Job, JobStatus, JobUpdate, PipelineMessage};
use crate::pipeline::prompts::PromptLibrary;
use crate::pipeline::{Collaborators, StageTable, StepDispatcher, Transitions};
use crate::queue::StepQueue;
use crate::store::{ArtifactStore, AuditEntry, AuditSink, JobStore, SecretStore};

pub const SECRET_NAME: &str = crate::config::DEFAULT_SECRET_NAME;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Scripted provider ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Text(TextCompletion),
    Tool(ToolCompletion),
    Error(LlmError),
}

const SCRIPTED_USAGE: Usage = Usage {
    input_tokens: 10,
    output_tokens: 20,
};

impl ScriptedResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(TextCompletion {
            text: text.to_string(),
            usage: SCRIPTED_USAGE,
            stop_reason: StopReason::Complete,
        })
    }

    pub fn truncated_text(text: &str) -> Self {
        Self::Text(TextCompletion {
            text: text.to_string(),
            usage: SCRIPTED_USAGE,
            stop_reason: StopReason::MaxTokens,
        })
    }

    /// Returned for either kind of call.
    pub fn error(err: LlmError) -> Self {
        Self::Error(err)
    }

    /// A complete `write_files` call with the given `(path, content)` pairs.
    pub fn files(files: &[(&str, &str)]) -> Self {
        let input = json!({
            "files": files
                .iter()
                .map(|(path, content)| json!({"path": path, "content": content}))
                .collect::<Vec<_>>()
        });
        Self::tool(input)
    }

    pub fn tool(input: Value) -> Self {
        Self::Tool(ToolCompletion {
            tool_use_id: String::new(),
            tool_name: WRITE_FILES_TOOL.to_string(),
            raw_input: input.to_string(),
            input,
            usage: SCRIPTED_USAGE,
            stop_reason: StopReason::Complete,
        })
    }

    /// A tool call cut off at the token ceiling with `raw` as the partial JSON.
    pub fn truncated_tool(raw: &str) -> Self {
        let input = match salvage_files(raw) {
            Some(files) => json!({ "files": files }),
            None => json!({}),
        };
        Self::Tool(ToolCompletion {
            tool_use_id: String::new(),
            tool_name: WRITE_FILES_TOOL.to_string(),
            input,
            raw_input: raw.to_string(),
            usage: SCRIPTED_USAGE,
            stop_reason: StopReason::MaxTokens,
        })
    }
}

type CallHook = Box<dyn Fn() + Send + Sync>;

/// Pops one queued response per call and records every request.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
    hook: Mutex<Option<CallHook>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ScriptedResponse) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Run `hook` at the start of every call, before the response is popped.
    pub fn on_call(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.hook) = Some(Box::new(hook));
    }

    fn next(&self, request: &CompletionRequest) -> Option<ScriptedResponse> {
        if let Some(hook) = lock(&self.hook).as_ref() {
            hook();
        }
        let call = {
            let mut requests = lock(&self.requests);
            requests.push(request.clone());
            requests.len()
        };
        lock(&self.responses).pop_front().map(|response| match response {
            ScriptedResponse::Tool(mut tool) => {
                tool.tool_use_id = format!("toolu_{call}");
                ScriptedResponse::Tool(tool)
            }
            other => other,
        })
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete_text(&self, request: &CompletionRequest) -> Result<TextCompletion, LlmError> {
        match self.next(request) {
            Some(ScriptedResponse::Text(text)) => Ok(text),
            Some(ScriptedResponse::Error(err)) => Err(err),
            Some(ScriptedResponse::Tool(_)) => Err(LlmError::Malformed(
                "scripted a tool call for a text request".into(),
            )),
            None => Err(LlmError::Malformed("no scripted response left".into())),
        }
    }

    async fn complete_with_tool(
        &self,
        request: &CompletionRequest,
    ) -> Result<ToolCompletion, LlmError> {
        match self.next(request) {
            Some(ScriptedResponse::Tool(tool)) => Ok(tool),
            Some(ScriptedResponse::Error(err)) => Err(err),
            Some(ScriptedResponse::Text(_)) => Err(LlmError::Malformed(
                "scripted text for a tool request".into(),
            )),
            None => Err(LlmError::Malformed("no scripted response left".into())),
        }
    }
}

// ── Stores ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    failing: bool,
}

impl MemoryAuditSink {
    /// Rejects every write.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
        if self.failing {
            return Err(StoreError::Database(anyhow::anyhow!("audit table unavailable")));
        }
        lock(&self.entries).push(entry);
        Ok(())
    }
}

/// Job store with the same compare-and-swap semantics as the SQLite one.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    failing_updates: Mutex<usize>,
}

impl MemoryJobStore {
    pub fn insert(&self, job: Job) {
        lock(&self.jobs).insert(job.id.clone(), job);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        lock(&self.jobs).get(id).cloned()
    }

    /// Edit a stored job directly, bypassing guards and timestamps.
    pub fn modify(&self, id: &str, f: impl FnOnce(&mut Job)) {
        if let Some(job) = lock(&self.jobs).get_mut(id) {
            f(job);
        }
    }

    pub fn set_updated_at(&self, id: &str, at: DateTime<Utc>) {
        self.modify(id, |job| job.updated_at = at);
    }

    /// The next `n` calls to `update_job` fail with a database error.
    pub fn fail_next_updates(&self, n: usize) {
        *lock(&self.failing_updates) = n;
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, owner_id: &str, title: &str, brief: &str) -> Result<Job, StoreError> {
        let job = Job::new(&uuid::Uuid::new_v4().to_string(), owner_id, title, brief);
        self.insert(job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.job(id))
    }

    async fn update_job(
        &self,
        id: &str,
        update: &JobUpdate,
        expected: Option<JobStatus>,
    ) -> Result<Job, StoreError> {
        {
            let mut failing = lock(&self.failing_updates);
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Database(anyhow::anyhow!("disk I/O error")));
            }
        }
        let mut jobs = lock(&self.jobs);
        let job = jobs.get_mut(id).ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if let Some(expected) = expected {
            if job.status != expected {
                return Err(StoreError::StatusMismatch {
                    id: id.to_string(),
                    expected,
                    actual: job.status,
                });
            }
        }
        job.apply(update);
        Ok(job.clone())
    }

    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut stale: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|job| statuses.contains(&job.status) && job.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.updated_at);
        Ok(stale)
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn set(&self, owner_id: &str, name: &str, value: &str) {
        lock(&self.secrets).insert((owner_id.to_string(), name.to_string()), value.to_string());
    }

    /// Drop every secret the owner has.
    pub fn remove(&self, owner_id: &str) {
        lock(&self.secrets).retain(|(owner, _), _| owner != owner_id);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn read_secret(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.secrets)
            .get(&(owner_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn write_secret(&self, owner_id: &str, name: &str, value: &str) -> Result<(), StoreError> {
        self.set(owner_id, name, value);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts_before_failure: Mutex<Option<usize>>,
}

impl MemoryArtifactStore {
    pub fn insert(&self, key: &str, bytes: &[u8]) {
        lock(&self.objects).insert(key.to_string(), bytes.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Let `n` more puts succeed, then fail every put after them.
    pub fn fail_puts_after(&self, n: usize) {
        *lock(&self.puts_before_failure) = Some(n);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects).keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(remaining) = lock(&self.puts_before_failure).as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Database(anyhow::anyhow!("no space left on device")));
            }
            *remaining -= 1;
        }
        self.insert(key, bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.objects).remove(key);
        Ok(())
    }
}

/// Records enqueued messages instead of delivering them.
#[derive(Default)]
pub struct RecordingQueue {
    messages: Mutex<Vec<PipelineMessage>>,
    failing: Mutex<bool>,
}

impl RecordingQueue {
    pub fn messages(&self) -> Vec<PipelineMessage> {
        lock(&self.messages).clone()
    }

    /// Take every recorded message, leaving the queue empty.
    pub fn drain(&self) -> Vec<PipelineMessage> {
        std::mem::take(&mut *lock(&self.messages))
    }

    pub fn fail_enqueue(&self, fail: bool) {
        *lock(&self.failing) = fail;
    }
}

#[async_trait]
impl StepQueue for RecordingQueue {
    async fn enqueue(&self, message: PipelineMessage) -> anyhow::Result<()> {
        if *lock(&self.failing) {
            anyhow::bail!("queue unavailable");
        }
        lock(&self.messages).push(message);
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// Every collaborator in memory, with an API key already stored for `o1`.
pub struct TestHarness {
    pub jobs: Arc<MemoryJobStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub queue: Arc<RecordingQueue>,
    pub provider: Arc<ScriptedProvider>,
    pub transitions: Transitions,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub const OWNER: &'static str = "o1";
    pub const API_KEY: &'static str = "sk-ant-test";

    pub fn new() -> Self {
        let jobs = Arc::new(MemoryJobStore::default());
        let secrets = Arc::new(MemorySecretStore::default());
        secrets.set(Self::OWNER, SECRET_NAME, Self::API_KEY);
        let artifacts = Arc::new(MemoryArtifactStore::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let queue = Arc::new(RecordingQueue::default());
        let provider = Arc::new(ScriptedProvider::new());
        let collaborators = Collaborators {
            jobs: jobs.clone(),
            secrets: secrets.clone(),
            artifacts: artifacts.clone(),
            audit: audit.clone(),
            queue: queue.clone(),
            provider: provider.clone(),
        };
        Self {
            transitions: Transitions::new(&collaborators),
            jobs,
            secrets,
            artifacts,
            audit,
            queue,
            provider,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            jobs: self.jobs.clone(),
            secrets: self.secrets.clone(),
            artifacts: self.artifacts.clone(),
            audit: self.audit.clone(),
            queue: self.queue.clone(),
            provider: self.provider.clone(),
        }
    }

    pub fn dispatcher(&self) -> StepDispatcher {
        StepDispatcher::new(
            &self.collaborators(),
            Arc::new(PromptLibrary::builtin()),
            StageTable::new("test-model"),
            SECRET_NAME,
        )
    }

    /// Store a job owned by `o1` in `status`, after `setup` has filled it in.
    pub async fn insert_job(&self, status: JobStatus, setup: impl FnOnce(&mut Job)) -> Job {
        let mut job = Job::new(&uuid::Uuid::new_v4().to_string(), Self::OWNER, "Test feature", "A brief");
        job.status = status;
        setup(&mut job);
        self.jobs.insert(job.clone());
        job
    }
}
