//! Reclaims jobs whose step never finished.
//!
//! A step that crashed, or whose completion write was lost, leaves its job in
//! a processing status forever. The sweep moves such jobs to `failed` with a
//! compare-and-swap write, so a job that completed between the read and the
//! write keeps its new status.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::models::{Job, JobStatus, JobUpdate};
use crate::errors::StoreError;
use crate::store::JobStore;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub failed: usize,
    /// Jobs that moved on before the write landed.
    pub skipped: usize,
    pub errors: usize,
}

pub struct StuckJobSweep {
    jobs: Arc<dyn JobStore>,
    stale_after: Duration,
}

impl StuckJobSweep {
    pub fn new(jobs: Arc<dyn JobStore>, stale_after: Duration) -> Self {
        Self { jobs, stale_after }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let stale = self
            .jobs
            .list_stale(&JobStatus::PROCESSING, now - threshold)
            .await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };
        for job in stale {
            let update = JobUpdate::failed(self.message(&job));
            match self.jobs.update_job(&job.id, &update, Some(job.status)).await {
                Ok(_) => {
                    info!(job_id = %job.id, status = %job.status, outcome = "failed", "stuck job reclaimed");
                    report.failed += 1;
                }
                Err(StoreError::StatusMismatch { actual, .. }) => {
                    info!(
                        job_id = %job.id,
                        status = %job.status,
                        now = %actual,
                        outcome = "skipped",
                        "job moved on before the sweep wrote"
                    );
                    report.skipped += 1;
                }
                Err(StoreError::NotFound { .. }) => {
                    info!(job_id = %job.id, status = %job.status, outcome = "skipped", "job disappeared");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(job_id = %job.id, status = %job.status, outcome = "error", error = %err, "could not reclaim stuck job");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    fn message(&self, job: &Job) -> String {
        let minutes = (self.stale_after.as_secs() / 60).max(1);
        format!(
            "This job stopped making progress while {} and was stopped after {minutes} minutes without an update. Retry to resume from the last checkpoint.",
            describe(job.status)
        )
    }

    /// Sweep every `interval` until `shutdown` resolves.
    pub async fn run(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("sweep stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.examined > 0 => {
                            info!(
                                examined = report.examined,
                                failed = report.failed,
                                skipped = report.skipped,
                                errors = report.errors,
                                "sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "sweep could not list stale jobs"),
                    }
                }
            }
        }
    }
}

fn describe(status: JobStatus) -> &'static str {
    match status {
        JobStatus::SpecGenerating => "generating the specification",
        JobStatus::PlanGenerating => "generating the implementation plan",
        JobStatus::TestsGenerating => "generating the test plan",
        JobStatus::Implementing => "implementing",
        JobStatus::Review => "under review",
        _ => "processing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryJobStore, TestHarness};
    use async_trait::async_trait;

    fn sweep(jobs: Arc<dyn JobStore>) -> StuckJobSweep {
        StuckJobSweep::new(jobs, DEFAULT_STALE_AFTER)
    }

    #[tokio::test]
    async fn test_fails_job_idle_past_threshold() {
        let h = TestHarness::new();
        let job = h.insert_job(JobStatus::Implementing, |_| {}).await;
        let now = Utc::now();
        h.jobs.set_updated_at(&job.id, now - chrono::Duration::minutes(15));

        let report = sweep(h.jobs.clone()).sweep_once(now).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.failed, 1);

        let stored = h.jobs.job(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let message = stored.error_message.unwrap();
        assert!(message.contains("10 minutes"));
        assert!(message.contains("implementing"));
    }

    #[tokio::test]
    async fn test_leaves_recent_and_non_processing_jobs_alone() {
        let h = TestHarness::new();
        let now = Utc::now();
        let fresh = h.insert_job(JobStatus::SpecGenerating, |_| {}).await;
        h.jobs.set_updated_at(&fresh.id, now - chrono::Duration::minutes(5));
        let gate = h.insert_job(JobStatus::SpecReady, |_| {}).await;
        h.jobs.set_updated_at(&gate.id, now - chrono::Duration::hours(2));

        let report = sweep(h.jobs.clone()).sweep_once(now).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(h.jobs.job(&fresh.id).unwrap().status, JobStatus::SpecGenerating);
        assert_eq!(h.jobs.job(&gate.id).unwrap().status, JobStatus::SpecReady);
    }

    /// Moves every listed job to `tests_ready` right after the snapshot is
    /// taken, as if the step had just completed.
    struct CompletesAfterRead(Arc<MemoryJobStore>);

    #[async_trait]
    impl JobStore for CompletesAfterRead {
        async fn create_job(&self, owner_id: &str, title: &str, brief: &str) -> Result<Job, StoreError> {
            self.0.create_job(owner_id, title, brief).await
        }

        async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
            self.0.get_job(id).await
        }

        async fn update_job(
            &self,
            id: &str,
            update: &JobUpdate,
            expected: Option<JobStatus>,
        ) -> Result<Job, StoreError> {
            self.0.update_job(id, update, expected).await
        }

        async fn list_stale(
            &self,
            statuses: &[JobStatus],
            older_than: DateTime<Utc>,
        ) -> Result<Vec<Job>, StoreError> {
            let snapshot = self.0.list_stale(statuses, older_than).await?;
            for job in &snapshot {
                self.0.modify(&job.id, |j| j.status = JobStatus::TestsReady);
            }
            Ok(snapshot)
        }
    }

    #[tokio::test]
    async fn test_job_that_moved_on_is_not_failed() {
        let h = TestHarness::new();
        let job = h.insert_job(JobStatus::TestsGenerating, |_| {}).await;
        let now = Utc::now();
        h.jobs.set_updated_at(&job.id, now - chrono::Duration::minutes(30));

        let racing = Arc::new(CompletesAfterRead(h.jobs.clone()));
        let report = sweep(racing).sweep_once(now).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);

        let stored = h.jobs.job(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::TestsReady);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn test_write_errors_are_counted_not_fatal() {
        let h = TestHarness::new();
        let now = Utc::now();
        for _ in 0..2 {
            let job = h.insert_job(JobStatus::Review, |_| {}).await;
            h.jobs.set_updated_at(&job.id, now - chrono::Duration::minutes(11));
        }
        h.jobs.fail_next_updates(1);

        let report = sweep(h.jobs.clone()).sweep_once(now).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = TestHarness::new();
        let job = h.insert_job(JobStatus::Implementing, |_| {}).await;
        h.jobs.set_updated_at(&job.id, Utc::now() - chrono::Duration::hours(1));

        let sweep = sweep(h.jobs.clone());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            sweep
                .run(Duration::from_secs(60), async {
                    let _ = rx.await;
                })
                .await;
        });
        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(());
        handle.await.unwrap();

        assert_eq!(h.jobs.job(&job.id).unwrap().status, JobStatus::Failed);
    }
}
