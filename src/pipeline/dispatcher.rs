//! Queue consumer: one message, one step of one job.
//!
//! Business failures never escape to the queue. They end in a `failed` job
//! carrying a plain-language message. Only infrastructure trouble (the job
//! store refusing even the failure write) is returned as `Err` so the queue
//! redelivers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Collaborators;
use super::code_runner::CodeRunner;
use super::models::{GeneratedFile, Job, JobField, JobStatus, JobUpdate, PipelineMessage, StepKind};
use super::prompts::{self, PromptLibrary};
use super::step_runner::{Agent, RunContext, StageTable, StepRunner};
use super::verdict::{self, Resolution};
use crate::errors::{StepError, StoreError};
use crate::queue::{StepHandler, StepQueue};
use crate::store::{ArtifactStore, JobStore, SecretStore, artifact_key};

const TRUNCATION_NOTE: &str = "\n\n---\n\n_Note: this document was cut off because the model reached its output limit. Revise to simplify the request if important sections are missing._";

/// What a step produced: the write to apply and the step to run next.
/// An empty update skips the write and only schedules `next`.
#[derive(Debug)]
struct StepOutcome {
    update: JobUpdate,
    next: Option<StepKind>,
    artifacts: Option<ArtifactSwap>,
}

impl StepOutcome {
    fn stop(update: JobUpdate) -> Self {
        Self {
            update,
            next: None,
            artifacts: None,
        }
    }

    fn then(update: JobUpdate, next: StepKind) -> Self {
        Self {
            update,
            next: Some(next),
            artifacts: None,
        }
    }

    fn resume(next: StepKind) -> Self {
        Self::then(JobUpdate::new(), next)
    }

    fn with_artifacts(mut self, swap: ArtifactSwap) -> Self {
        self.artifacts = Some(swap);
        self
    }
}

/// Artifact paths whose fate depends on whether the manifest write lands.
#[derive(Debug, Default)]
struct ArtifactSwap {
    /// Written by this run and absent from the previous manifest.
    added: Vec<String>,
    /// In the previous manifest but not produced by this run.
    stale: Vec<String>,
}

/// The three document stages share one shape.
struct DocumentStage {
    agent: Agent,
    output: JobField,
    gate: JobStatus,
    recommendation: JobField,
    label: &'static str,
}

const SPEC_STAGE: DocumentStage = DocumentStage {
    agent: Agent::Spec,
    output: JobField::Spec,
    gate: JobStatus::SpecReady,
    recommendation: JobField::SpecRecommendation,
    label: "specification",
};

const PLAN_STAGE: DocumentStage = DocumentStage {
    agent: Agent::Plan,
    output: JobField::Plan,
    gate: JobStatus::PlanReady,
    recommendation: JobField::PlanRecommendation,
    label: "implementation plan",
};

const TESTS_STAGE: DocumentStage = DocumentStage {
    agent: Agent::Tests,
    output: JobField::Tests,
    gate: JobStatus::TestsReady,
    recommendation: JobField::TestsRecommendation,
    label: "test plan",
};

pub struct StepDispatcher {
    jobs: Arc<dyn JobStore>,
    secrets: Arc<dyn SecretStore>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<dyn StepQueue>,
    runner: StepRunner,
    code_runner: CodeRunner,
    prompts: Arc<PromptLibrary>,
    stages: StageTable,
    secret_name: String,
}

impl StepDispatcher {
    pub fn new(
        collaborators: &Collaborators,
        prompts: Arc<PromptLibrary>,
        stages: StageTable,
        secret_name: impl Into<String>,
    ) -> Self {
        Self {
            jobs: collaborators.jobs.clone(),
            secrets: collaborators.secrets.clone(),
            artifacts: collaborators.artifacts.clone(),
            queue: collaborators.queue.clone(),
            runner: StepRunner::new(collaborators.provider.clone(), collaborators.audit.clone()),
            code_runner: CodeRunner::new(
                collaborators.provider.clone(),
                collaborators.audit.clone(),
            ),
            prompts,
            stages,
            secret_name: secret_name.into(),
        }
    }

    /// Process one message. See the module docs for the error contract.
    pub async fn dispatch(&self, message: &PipelineMessage) -> anyhow::Result<()> {
        let Some(job) = self.jobs.get_job(&message.job_id).await? else {
            warn!(job_id = %message.job_id, step = %message.kind, "job not found, dropping message");
            return Ok(());
        };
        if job.owner_id != message.owner_id {
            warn!(job_id = %job.id, step = %message.kind, "owner mismatch, dropping message");
            return Ok(());
        }
        let runs_in = message.kind.runs_in();
        if job.status != runs_in {
            info!(
                job_id = %job.id,
                step = %message.kind,
                status = %job.status,
                "job has moved on, skipping stale message"
            );
            return Ok(());
        }

        info!(job_id = %job.id, step = %message.kind, "step started");
        let outcome = match message.kind {
            StepKind::GenerateSpec => self.document_step(&job, &SPEC_STAGE).await,
            StepKind::GeneratePlan => self.document_step(&job, &PLAN_STAGE).await,
            StepKind::GenerateTests => self.document_step(&job, &TESTS_STAGE).await,
            StepKind::Implement => self.implement_step(&job).await,
            StepKind::SecurityReview => self.security_review_step(&job).await,
            StepKind::CodeReview => self.code_review_step(&job).await,
            StepKind::ResolveVerdict => self.resolve_step(&job),
        };

        match outcome {
            Ok(outcome) => self.commit(&job, message.kind, outcome).await,
            Err(err) => {
                warn!(job_id = %job.id, step = %message.kind, error = %err, "step failed");
                self.fail_job(&job.id, runs_in, &err.to_string()).await
            }
        }
    }

    async fn commit(&self, job: &Job, step: StepKind, outcome: StepOutcome) -> anyhow::Result<()> {
        let runs_in = step.runs_in();
        let swap = outcome.artifacts.unwrap_or_default();
        let result = if outcome.update == JobUpdate::new() {
            Ok(job.clone())
        } else {
            self.jobs
                .update_job(&job.id, &outcome.update, Some(runs_in))
                .await
        };
        let updated = match result {
            Ok(updated) => updated,
            Err(StoreError::StatusMismatch { actual, .. }) => {
                // The sweep (or a user) got there first; do not resurrect it.
                warn!(job_id = %job.id, step = %step, status = %actual, "job changed during step, result discarded");
                self.delete_artifacts(job, &swap.added).await;
                return Ok(());
            }
            Err(StoreError::NotFound { .. }) => {
                warn!(job_id = %job.id, step = %step, "job deleted during step, result discarded");
                self.delete_artifacts(job, &swap.added).await;
                return Ok(());
            }
            Err(err) => {
                warn!(job_id = %job.id, step = %step, error = %err, "failed to save step result");
                self.delete_artifacts(job, &swap.added).await;
                let message = StepError::Persistence(err.to_string()).to_string();
                return self.fail_job(&job.id, runs_in, &message).await;
            }
        };
        self.delete_artifacts(job, &swap.stale).await;
        info!(job_id = %job.id, step = %step, status = %updated.status, "step finished");

        if let Some(next) = outcome.next {
            if let Err(err) = self
                .queue
                .enqueue(PipelineMessage::for_job(next, &updated))
                .await
            {
                warn!(job_id = %job.id, next = %next, error = %err, "failed to enqueue next step");
                let message = format!(
                    "Could not schedule the {next} step: {err}. Retry to resume from the last checkpoint."
                );
                return self.fail_job(&job.id, updated.status, &message).await;
            }
        }
        Ok(())
    }

    /// Best effort: a file that cannot be removed is logged and left behind.
    async fn delete_artifacts(&self, job: &Job, paths: &[String]) {
        for path in paths {
            if let Err(err) = self
                .artifacts
                .delete(&artifact_key(&job.owner_id, &job.id, path))
                .await
            {
                warn!(job_id = %job.id, path = %path, error = %err, "failed to delete artifact");
            }
        }
    }

    /// Move the job to `failed` if it is still in `expected`.
    async fn fail_job(&self, id: &str, expected: JobStatus, message: &str) -> anyhow::Result<()> {
        match self
            .jobs
            .update_job(id, &JobUpdate::failed(message), Some(expected))
            .await
        {
            Ok(_) => {
                info!(job_id = %id, "job failed");
                Ok(())
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                debug!(job_id = %id, status = %actual, "job already moved on, not failing it");
                Ok(())
            }
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context(format!("failed to mark job {id} failed"))),
        }
    }

    async fn context(&self, job: &Job) -> Result<RunContext, StepError> {
        let api_key = self
            .secrets
            .read_secret(&job.owner_id, &self.secret_name)
            .await
            .map_err(|e| StepError::Load(e.to_string()))?
            .filter(|key| !key.trim().is_empty())
            .ok_or(StepError::MissingCredential)?;
        Ok(RunContext {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            api_key,
        })
    }

    async fn document_step(
        &self,
        job: &Job,
        stage: &DocumentStage,
    ) -> Result<StepOutcome, StepError> {
        let ctx = self.context(job).await?;
        let prompt = match stage.agent {
            Agent::Spec => prompts::spec_prompt(job),
            Agent::Plan => prompts::plan_prompt(job, require(&job.spec_md, "specification")?),
            _ => prompts::tests_prompt(
                job,
                require(&job.spec_md, "specification")?,
                require(&job.plan_md, "implementation plan")?,
            ),
        };

        let output = self
            .runner
            .run(
                &ctx,
                stage.agent,
                self.prompts.system(stage.agent),
                prompt,
                &self.stages.get(stage.agent),
            )
            .await?;
        let mut document = output.text;
        if output.was_truncated {
            document.push_str(TRUNCATION_NOTE);
        }

        let recommendation = self.alignment(&ctx, job, stage.label, &document).await;
        let update = JobUpdate::to_status(stage.gate)
            .set(stage.output, document)
            .set_opt(stage.recommendation, recommendation)
            .clear(JobField::Error);
        Ok(StepOutcome::stop(update))
    }

    /// Advisory only: a failed check leaves no recommendation.
    async fn alignment(
        &self,
        ctx: &RunContext,
        job: &Job,
        label: &str,
        document: &str,
    ) -> Option<String> {
        let result = self
            .runner
            .run(
                ctx,
                Agent::Alignment,
                self.prompts.system(Agent::Alignment),
                prompts::alignment_prompt(job, label, document),
                &self.stages.get(Agent::Alignment),
            )
            .await;
        match result {
            Ok(output) if !output.text.trim().is_empty() => Some(output.text),
            Ok(_) => None,
            Err(err) => {
                warn!(job_id = %job.id, stage = label, error = %err, "alignment check failed, continuing");
                None
            }
        }
    }

    async fn implement_step(&self, job: &Job) -> Result<StepOutcome, StepError> {
        let ctx = self.context(job).await?;
        let spec = require(&job.spec_md, "specification")?;
        let plan = require(&job.plan_md, "implementation plan")?;
        let tests = require(&job.tests_md, "test plan")?;

        let output = self
            .code_runner
            .generate(
                &ctx,
                self.prompts.system(Agent::Implementer),
                prompts::implement_prompt(job, spec, plan, tests),
                &self.stages.get(Agent::Implementer),
            )
            .await?;

        // Write first; the previous manifest stays readable until the commit
        // replaces it, and only then are its leftovers removed.
        let mut swap = ArtifactSwap {
            stale: job
                .generated_files
                .iter()
                .filter(|old| !output.files.iter().any(|f| &&f.path == old))
                .cloned()
                .collect(),
            ..ArtifactSwap::default()
        };
        for file in &output.files {
            let stored = self
                .artifacts
                .put(
                    &artifact_key(&job.owner_id, &job.id, &file.path),
                    file.content.as_bytes(),
                )
                .await;
            if let Err(err) = stored {
                self.delete_artifacts(job, &swap.added).await;
                return Err(StepError::Artifact(format!("{}: {err}", file.path)));
            }
            if !job.generated_files.contains(&file.path) {
                swap.added.push(file.path.clone());
            }
        }

        let warning = output.was_truncated.then(|| {
            format!(
                "The implementation hit the model's output limit. {} complete file(s) were kept; anything after them was dropped.",
                output.files.len()
            )
        });
        info!(
            job_id = %job.id,
            files = output.files.len(),
            attempts = output.attempts,
            was_truncated = output.was_truncated,
            "implementation stored"
        );
        let update = JobUpdate::to_status(JobStatus::Review)
            .files(output.files.iter().map(|f| f.path.clone()).collect())
            .set_opt(JobField::Warning, warning)
            .clear(JobField::SecurityReview)
            .clear(JobField::CodeReview)
            .clear(JobField::Error);
        Ok(StepOutcome::then(update, StepKind::SecurityReview).with_artifacts(swap))
    }

    async fn load_files(&self, job: &Job) -> Result<Vec<GeneratedFile>, StepError> {
        let mut files = Vec::with_capacity(job.generated_files.len());
        for path in &job.generated_files {
            let bytes = self
                .artifacts
                .get(&artifact_key(&job.owner_id, &job.id, path))
                .await
                .map_err(|e| StepError::Artifact(e.to_string()))?
                .ok_or_else(|| StepError::Artifact(format!("{path} is missing from storage")))?;
            files.push(GeneratedFile::new(
                path.clone(),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        if files.is_empty() {
            return Err(StepError::MissingInput {
                what: "implementation",
            });
        }
        Ok(files)
    }

    async fn review(&self, job: &Job, agent: Agent) -> Result<String, StepError> {
        let ctx = self.context(job).await?;
        let spec = require(&job.spec_md, "specification")?;
        let plan = require(&job.plan_md, "implementation plan")?;
        let files = self.load_files(job).await?;

        let output = self
            .runner
            .run(
                &ctx,
                agent,
                self.prompts.system(agent),
                prompts::review_prompt(job, spec, plan, &files),
                &self.stages.get(agent),
            )
            .await?;
        Ok(if output.was_truncated {
            verdict::force_fail(&output.text)
        } else {
            output.text
        })
    }

    async fn security_review_step(&self, job: &Job) -> Result<StepOutcome, StepError> {
        if job.security_review_md.is_some() {
            debug!(job_id = %job.id, "security review already recorded, resuming at code review");
            return Ok(StepOutcome::resume(StepKind::CodeReview));
        }
        let report = self.review(job, Agent::SecurityReviewer).await?;
        let update = JobUpdate::new().set(JobField::SecurityReview, report);
        Ok(StepOutcome::then(update, StepKind::CodeReview))
    }

    async fn code_review_step(&self, job: &Job) -> Result<StepOutcome, StepError> {
        if job.code_review_md.is_some() {
            debug!(job_id = %job.id, "code review already recorded, resuming at verdict");
            return Ok(StepOutcome::resume(StepKind::ResolveVerdict));
        }
        let report = self.review(job, Agent::CodeReviewer).await?;
        let update = JobUpdate::new().set(JobField::CodeReview, report);
        Ok(StepOutcome::then(update, StepKind::ResolveVerdict))
    }

    fn resolve_step(&self, job: &Job) -> Result<StepOutcome, StepError> {
        let security = verdict::parse_verdict(require(&job.security_review_md, "security review")?);
        let code = verdict::parse_verdict(require(&job.code_review_md, "code review")?);
        info!(job_id = %job.id, %security, %code, "review verdicts");
        let update = match verdict::resolve(security, code) {
            Resolution::Done => JobUpdate::to_status(JobStatus::Done).clear(JobField::Error),
            Resolution::Failed(message) => JobUpdate::failed(message),
        };
        Ok(StepOutcome::stop(update))
    }
}

fn require<'a>(value: &'a Option<String>, what: &'static str) -> Result<&'a str, StepError> {
    value
        .as_deref()
        .ok_or(StepError::MissingInput { what })
}

#[async_trait]
impl StepHandler for StepDispatcher {
    async fn handle(&self, message: PipelineMessage) -> anyhow::Result<()> {
        self.dispatch(&message).await
    }
}
