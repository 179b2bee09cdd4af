//! User- and system-triggered job transitions.
//!
//! Every transition is a compare-and-swap against the status the job was
//! read in, so two concurrent requests cannot both advance the same job.

use std::sync::Arc;

use tracing::{info, warn};

use super::Collaborators;
use super::models::{Job, JobField, JobStatus, JobUpdate, PipelineMessage, StepKind};
use crate::errors::{StoreError, TransitionError};
use crate::queue::StepQueue;
use crate::store::{ArtifactStore, JobStore, artifact_key};

/// Fields produced after each checkpoint. Rolling back to a checkpoint clears
/// its list and every list after it.
const AFTER_SPEC: &[JobField] = &[JobField::Plan, JobField::PlanRecommendation];
const AFTER_PLAN: &[JobField] = &[JobField::Tests, JobField::TestsRecommendation];
const AFTER_TESTS: &[JobField] = &[
    JobField::SecurityReview,
    JobField::CodeReview,
    JobField::Warning,
    JobField::Error,
];

/// The latest checkpoint a failed job can resume from, inferred from which
/// deliverables are present.
pub fn rollback_target(job: &Job) -> JobStatus {
    if job.tests_md.is_some() {
        JobStatus::TestsReady
    } else if job.plan_md.is_some() {
        JobStatus::PlanReady
    } else if job.spec_md.is_some() {
        JobStatus::SpecReady
    } else {
        JobStatus::Drafting
    }
}

/// The status and step that approving a gate leads to.
pub fn approval_target(status: JobStatus) -> Option<(JobStatus, StepKind)> {
    match status {
        JobStatus::SpecReady => Some((JobStatus::PlanGenerating, StepKind::GeneratePlan)),
        JobStatus::PlanReady => Some((JobStatus::TestsGenerating, StepKind::GenerateTests)),
        JobStatus::TestsReady => Some((JobStatus::Implementing, StepKind::Implement)),
        _ => None,
    }
}

fn clear_all(mut update: JobUpdate, fields: &[JobField]) -> JobUpdate {
    for field in fields {
        update = update.clear(*field);
    }
    update
}

#[derive(Clone)]
pub struct Transitions {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<dyn StepQueue>,
}

impl Transitions {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            jobs: collaborators.jobs.clone(),
            artifacts: collaborators.artifacts.clone(),
            queue: collaborators.queue.clone(),
        }
    }

    async fn load(&self, id: &str) -> Result<Job, TransitionError> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or_else(|| TransitionError::NotFound { id: id.to_string() })
    }

    pub async fn get(&self, id: &str) -> Result<Job, TransitionError> {
        self.load(id).await
    }

    pub async fn create_job(
        &self,
        owner_id: &str,
        title: &str,
        brief: &str,
    ) -> Result<Job, TransitionError> {
        if owner_id.trim().is_empty() {
            return Err(TransitionError::Invalid("owner id must not be empty".into()));
        }
        if title.trim().is_empty() {
            return Err(TransitionError::Invalid("title must not be empty".into()));
        }
        let job = self.jobs.create_job(owner_id, title.trim(), brief).await?;
        info!(job_id = %job.id, owner_id, "job created");
        Ok(job)
    }

    /// Replace the brief. Only allowed while drafting.
    pub async fn update_brief(&self, id: &str, brief: &str) -> Result<Job, TransitionError> {
        self.jobs
            .update_job(
                id,
                &JobUpdate::new().set(JobField::Brief, brief),
                Some(JobStatus::Drafting),
            )
            .await
            .map_err(not_in_drafting)
    }

    /// `drafting -> spec_generating`.
    pub async fn start(&self, id: &str) -> Result<Job, TransitionError> {
        let job = self
            .jobs
            .update_job(
                id,
                &JobUpdate::to_status(JobStatus::SpecGenerating).clear(JobField::Error),
                Some(JobStatus::Drafting),
            )
            .await
            .map_err(not_in_drafting)?;
        info!(job_id = %job.id, "job started");
        self.enqueue(&job, StepKind::GenerateSpec).await?;
        Ok(job)
    }

    /// Advance past whichever gate the job is waiting at.
    pub async fn approve(&self, id: &str) -> Result<Job, TransitionError> {
        let current = self.load(id).await?;
        let Some((next, step)) = approval_target(current.status) else {
            return Err(TransitionError::InvalidState {
                message: format!(
                    "job is {}, approval is only possible at spec_ready, plan_ready or tests_ready",
                    current.status
                ),
                actual: current.status,
            });
        };
        let job = self
            .jobs
            .update_job(
                id,
                &JobUpdate::to_status(next).clear(JobField::Error),
                Some(current.status),
            )
            .await?;
        info!(job_id = %job.id, from = %current.status, to = %next, "gate approved");
        self.enqueue(&job, step).await?;
        Ok(job)
    }

    /// Rewind from any gate to spec generation, clearing everything
    /// downstream of the spec.
    pub async fn revise(&self, id: &str) -> Result<Job, TransitionError> {
        let current = self.load(id).await?;
        if !current.status.is_gate() {
            return Err(TransitionError::InvalidState {
                message: format!(
                    "job is {}, revision is only possible at spec_ready, plan_ready or tests_ready",
                    current.status
                ),
                actual: current.status,
            });
        }
        let mut update = JobUpdate::to_status(JobStatus::SpecGenerating)
            .clear(JobField::SpecRecommendation)
            .files(Vec::new());
        for fields in [AFTER_SPEC, AFTER_PLAN, AFTER_TESTS] {
            update = clear_all(update, fields);
        }
        let job = self
            .jobs
            .update_job(id, &update, Some(current.status))
            .await?;
        info!(job_id = %job.id, from = %current.status, "job sent back for revision");
        self.delete_artifacts(&current).await;
        self.enqueue(&job, StepKind::GenerateSpec).await?;
        Ok(job)
    }

    /// Roll a failed job back to its latest checkpoint. Nothing is enqueued:
    /// the job waits at a gate (or in drafting) for the user.
    pub async fn retry(&self, id: &str) -> Result<Job, TransitionError> {
        let current = self.load(id).await?;
        if current.status != JobStatus::Failed {
            return Err(TransitionError::InvalidState {
                message: format!("job is {}, only failed jobs can be retried", current.status),
                actual: current.status,
            });
        }
        let target = rollback_target(&current);
        let mut update = clear_all(JobUpdate::to_status(target).files(Vec::new()), AFTER_TESTS);
        if matches!(
            target,
            JobStatus::PlanReady | JobStatus::SpecReady | JobStatus::Drafting
        ) {
            update = clear_all(update, AFTER_PLAN);
        }
        if matches!(target, JobStatus::SpecReady | JobStatus::Drafting) {
            update = clear_all(update, AFTER_SPEC);
        }
        if target == JobStatus::Drafting {
            update = update.clear(JobField::Spec).clear(JobField::SpecRecommendation);
        }
        let job = self
            .jobs
            .update_job(id, &update, Some(JobStatus::Failed))
            .await?;
        info!(job_id = %job.id, to = %target, "failed job rolled back");
        self.delete_artifacts(&current).await;
        Ok(job)
    }

    async fn enqueue(&self, job: &Job, step: StepKind) -> Result<(), TransitionError> {
        let message = PipelineMessage::for_job(step, job);
        if let Err(err) = self.queue.enqueue(message).await {
            // Without a message the job would sit until the sweep finds it.
            let update = JobUpdate::failed(format!(
                "Could not schedule the {step} step. Retry to resume from the last checkpoint."
            ));
            if let Err(fail_err) = self.jobs.update_job(&job.id, &update, Some(job.status)).await {
                warn!(job_id = %job.id, error = %fail_err, "could not mark job failed after enqueue error");
            }
            return Err(TransitionError::Enqueue(err));
        }
        Ok(())
    }

    async fn delete_artifacts(&self, job: &Job) {
        for path in &job.generated_files {
            let key = artifact_key(&job.owner_id, &job.id, path);
            if let Err(err) = self.artifacts.delete(&key).await {
                warn!(job_id = %job.id, path = %path, error = %err, "failed to delete artifact");
            }
        }
    }
}

fn not_in_drafting(err: StoreError) -> TransitionError {
    match err {
        StoreError::StatusMismatch { actual, .. } => TransitionError::InvalidState {
            message: format!("not in drafting (job is {actual})"),
            actual,
        },
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_start_requires_drafting() {
        let h = TestHarness::new();
        let job = h.transitions.create_job("o1", "Add login", "brief").await.unwrap();

        let started = h.transitions.start(&job.id).await.unwrap();
        assert_eq!(started.status, JobStatus::SpecGenerating);
        let sent = h.queue.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, StepKind::GenerateSpec);
        assert_eq!(sent[0].job_id, job.id);
        assert_eq!(sent[0].title.as_deref(), Some("Add login"));

        let err = h.transitions.start(&job.id).await.unwrap_err();
        assert!(err.to_string().contains("not in drafting"));
        assert_eq!(h.queue.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let h = TestHarness::new();
        assert!(matches!(
            h.transitions.start("nope").await.unwrap_err(),
            TransitionError::NotFound { .. }
        ));
        assert!(matches!(
            h.transitions.approve("nope").await.unwrap_err(),
            TransitionError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_approve_advances_each_gate() {
        let h = TestHarness::new();
        for (gate, next, step) in [
            (JobStatus::SpecReady, JobStatus::PlanGenerating, StepKind::GeneratePlan),
            (JobStatus::PlanReady, JobStatus::TestsGenerating, StepKind::GenerateTests),
            (JobStatus::TestsReady, JobStatus::Implementing, StepKind::Implement),
        ] {
            let job = h.insert_job(gate, |_| {}).await;
            let approved = h.transitions.approve(&job.id).await.unwrap();
            assert_eq!(approved.status, next);
            assert_eq!(h.queue.messages().last().unwrap().kind, step);
        }
    }

    #[tokio::test]
    async fn test_approve_outside_a_gate_is_rejected_without_side_effects() {
        let h = TestHarness::new();
        for status in [
            JobStatus::Drafting,
            JobStatus::PlanGenerating,
            JobStatus::Review,
            JobStatus::Done,
            JobStatus::Failed,
        ] {
            let job = h.insert_job(status, |_| {}).await;
            let err = h.transitions.approve(&job.id).await.unwrap_err();
            assert!(matches!(err, TransitionError::InvalidState { actual, .. } if actual == status));
            assert_eq!(h.jobs.job(&job.id).unwrap().status, status);
        }
        assert!(h.queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_revise_clears_downstream_fields_and_artifacts() {
        let h = TestHarness::new();
        let job = h
            .insert_job(JobStatus::TestsReady, |j| {
                j.spec_md = Some("spec".into());
                j.plan_md = Some("plan".into());
                j.tests_md = Some("tests".into());
                j.spec_recommendation = Some("r1".into());
                j.plan_recommendation = Some("r2".into());
                j.tests_recommendation = Some("r3".into());
                j.generated_files = vec!["src/a.rs".into()];
                j.warning = Some("w".into());
            })
            .await;
        let key = artifact_key(&job.owner_id, &job.id, "src/a.rs");
        h.artifacts.insert(&key, b"old");

        let revised = h.transitions.revise(&job.id).await.unwrap();
        assert_eq!(revised.status, JobStatus::SpecGenerating);
        assert_eq!(revised.spec_md.as_deref(), Some("spec"));
        assert_eq!(revised.plan_md, None);
        assert_eq!(revised.tests_md, None);
        assert_eq!(revised.spec_recommendation, None);
        assert_eq!(revised.plan_recommendation, None);
        assert_eq!(revised.tests_recommendation, None);
        assert_eq!(revised.warning, None);
        assert!(revised.generated_files.is_empty());
        assert!(!h.artifacts.contains(&key));
        assert_eq!(h.queue.messages()[0].kind, StepKind::GenerateSpec);
    }

    #[tokio::test]
    async fn test_revise_requires_a_gate() {
        let h = TestHarness::new();
        let job = h.insert_job(JobStatus::Implementing, |_| {}).await;
        assert!(h.transitions.revise(&job.id).await.is_err());
        assert!(h.queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_retry_rolls_back_to_latest_checkpoint() {
        let h = TestHarness::new();
        let cases: [(fn(&mut Job), JobStatus); 4] = [
            (
                |j| {
                    j.spec_md = Some("s".into());
                    j.plan_md = Some("p".into());
                    j.tests_md = Some("t".into());
                    j.security_review_md = Some("sr".into());
                },
                JobStatus::TestsReady,
            ),
            (
                |j| {
                    j.spec_md = Some("s".into());
                    j.plan_md = Some("p".into());
                },
                JobStatus::PlanReady,
            ),
            (|j| j.spec_md = Some("s".into()), JobStatus::SpecReady),
            (|_| {}, JobStatus::Drafting),
        ];
        for (setup, expected) in cases {
            let job = h
                .insert_job(JobStatus::Failed, |j| {
                    setup(j);
                    j.error_message = Some("boom".into());
                })
                .await;
            let rolled = h.transitions.retry(&job.id).await.unwrap();
            assert_eq!(rolled.status, expected);
            assert_eq!(rolled.error_message, None);
            assert_eq!(rolled.security_review_md, None);
        }
        assert!(h.queue.messages().is_empty());
    }

    #[tokio::test]
    async fn test_retry_keeps_checkpoint_deliverable_and_clears_later_ones() {
        let h = TestHarness::new();
        let job = h
            .insert_job(JobStatus::Failed, |j| {
                j.spec_md = Some("s".into());
                j.plan_md = Some("p".into());
                j.plan_recommendation = Some("aligned".into());
                j.tests_recommendation = Some("stale".into());
            })
            .await;
        let rolled = h.transitions.retry(&job.id).await.unwrap();
        assert_eq!(rolled.status, JobStatus::PlanReady);
        assert_eq!(rolled.plan_md.as_deref(), Some("p"));
        assert_eq!(rolled.plan_recommendation.as_deref(), Some("aligned"));
        assert_eq!(rolled.tests_recommendation, None);
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let h = TestHarness::new();
        let job = h.insert_job(JobStatus::Done, |_| {}).await;
        let err = h.transitions.retry(&job.id).await.unwrap_err();
        assert!(err.to_string().contains("only failed jobs"));
    }

    #[tokio::test]
    async fn test_brief_is_editable_only_while_drafting() {
        let h = TestHarness::new();
        let job = h.transitions.create_job("o1", "t", "v1").await.unwrap();
        let job = h.transitions.update_brief(&job.id, "v2").await.unwrap();
        assert_eq!(job.brief, "v2");

        h.transitions.start(&job.id).await.unwrap();
        let err = h.transitions.update_brief(&job.id, "v3").await.unwrap_err();
        assert!(err.to_string().contains("not in drafting"));
    }

    #[tokio::test]
    async fn test_create_job_rejects_blank_title() {
        let h = TestHarness::new();
        assert!(matches!(
            h.transitions.create_job("o1", "  ", "b").await.unwrap_err(),
            TransitionError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_failure_fails_the_job() {
        let h = TestHarness::new();
        let job = h.transitions.create_job("o1", "t", "b").await.unwrap();
        h.queue.fail_enqueue(true);

        let err = h.transitions.start(&job.id).await.unwrap_err();
        assert!(matches!(err, TransitionError::Enqueue(_)));
        let stored = h.jobs.job(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_message.unwrap().contains("generate-spec"));
    }
}
