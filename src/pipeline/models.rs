use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a job sits in the pipeline. Declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Drafting,
    SpecGenerating,
    SpecReady,
    PlanGenerating,
    PlanReady,
    TestsGenerating,
    TestsReady,
    Implementing,
    Review,
    Done,
    Failed,
}

impl JobStatus {
    /// Every status a step can be running in. The stuck-job sweep only
    /// looks at these.
    pub const PROCESSING: [JobStatus; 5] = [
        Self::SpecGenerating,
        Self::PlanGenerating,
        Self::TestsGenerating,
        Self::Implementing,
        Self::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "drafting",
            Self::SpecGenerating => "spec_generating",
            Self::SpecReady => "spec_ready",
            Self::PlanGenerating => "plan_generating",
            Self::PlanReady => "plan_ready",
            Self::TestsGenerating => "tests_generating",
            Self::TestsReady => "tests_ready",
            Self::Implementing => "implementing",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Gates only advance on explicit approval.
    pub fn is_gate(&self) -> bool {
        matches!(self, Self::SpecReady | Self::PlanReady | Self::TestsReady)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafting" => Ok(Self::Drafting),
            "spec_generating" => Ok(Self::SpecGenerating),
            "spec_ready" => Ok(Self::SpecReady),
            "plan_generating" => Ok(Self::PlanGenerating),
            "plan_ready" => Ok(Self::PlanReady),
            "tests_generating" => Ok(Self::TestsGenerating),
            "tests_ready" => Ok(Self::TestsReady),
            "implementing" => Ok(Self::Implementing),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// One feature request moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: JobStatus,
    pub brief: String,
    pub spec_md: Option<String>,
    pub plan_md: Option<String>,
    pub tests_md: Option<String>,
    pub security_review_md: Option<String>,
    pub code_review_md: Option<String>,
    pub spec_recommendation: Option<String>,
    pub plan_recommendation: Option<String>,
    pub tests_recommendation: Option<String>,
    /// Paths of the files stored for this job in the artifact store.
    #[serde(default)]
    pub generated_files: Vec<String>,
    pub warning: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh job in `drafting`, as created by the job store.
    pub fn new(id: &str, owner_id: &str, title: &str, brief: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            status: JobStatus::Drafting,
            brief: brief.to_string(),
            spec_md: None,
            plan_md: None,
            tests_md: None,
            security_review_md: None,
            code_review_md: None,
            spec_recommendation: None,
            plan_recommendation: None,
            tests_recommendation: None,
            generated_files: Vec::new(),
            warning: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field(&self, field: JobField) -> Option<&str> {
        let value = match field {
            JobField::Brief => return Some(&self.brief),
            JobField::Spec => &self.spec_md,
            JobField::Plan => &self.plan_md,
            JobField::Tests => &self.tests_md,
            JobField::SecurityReview => &self.security_review_md,
            JobField::CodeReview => &self.code_review_md,
            JobField::SpecRecommendation => &self.spec_recommendation,
            JobField::PlanRecommendation => &self.plan_recommendation,
            JobField::TestsRecommendation => &self.tests_recommendation,
            JobField::Warning => &self.warning,
            JobField::Error => &self.error_message,
        };
        value.as_deref()
    }

    /// Apply an update in memory. Stores that cannot express the update as a
    /// single statement use this to stay consistent with the SQLite store.
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        for (field, value) in &update.fields {
            let slot = match field {
                JobField::Brief => {
                    self.brief = value.clone().unwrap_or_default();
                    continue;
                }
                JobField::Spec => &mut self.spec_md,
                JobField::Plan => &mut self.plan_md,
                JobField::Tests => &mut self.tests_md,
                JobField::SecurityReview => &mut self.security_review_md,
                JobField::CodeReview => &mut self.code_review_md,
                JobField::SpecRecommendation => &mut self.spec_recommendation,
                JobField::PlanRecommendation => &mut self.plan_recommendation,
                JobField::TestsRecommendation => &mut self.tests_recommendation,
                JobField::Warning => &mut self.warning,
                JobField::Error => &mut self.error_message,
            };
            *slot = value.clone();
        }
        if let Some(files) = &update.generated_files {
            self.generated_files = files.clone();
        }
        self.updated_at = Utc::now();
    }
}

/// Writable text columns of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobField {
    Brief,
    Spec,
    Plan,
    Tests,
    SecurityReview,
    CodeReview,
    SpecRecommendation,
    PlanRecommendation,
    TestsRecommendation,
    Warning,
    Error,
}

impl JobField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Spec => "spec_md",
            Self::Plan => "plan_md",
            Self::Tests => "tests_md",
            Self::SecurityReview => "security_review_md",
            Self::CodeReview => "code_review_md",
            Self::SpecRecommendation => "spec_recommendation",
            Self::PlanRecommendation => "plan_recommendation",
            Self::TestsRecommendation => "tests_recommendation",
            Self::Warning => "warning",
            Self::Error => "error_message",
        }
    }
}

/// A partial write to a job. `None` values clear the column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub fields: Vec<(JobField, Option<String>)>,
    pub generated_files: Option<Vec<String>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Move to `failed` carrying a plain-language explanation.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::to_status(JobStatus::Failed).set(JobField::Error, message)
    }

    pub fn set(mut self, field: JobField, value: impl Into<String>) -> Self {
        self.fields.push((field, Some(value.into())));
        self
    }

    pub fn set_opt(mut self, field: JobField, value: Option<String>) -> Self {
        self.fields.push((field, value));
        self
    }

    pub fn clear(mut self, field: JobField) -> Self {
        self.fields.push((field, None));
        self
    }

    pub fn files(mut self, paths: Vec<String>) -> Self {
        self.generated_files = Some(paths);
        self
    }
}

/// The seven pipeline steps a queue message can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    GenerateSpec,
    GeneratePlan,
    GenerateTests,
    Implement,
    SecurityReview,
    CodeReview,
    ResolveVerdict,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        Self::GenerateSpec,
        Self::GeneratePlan,
        Self::GenerateTests,
        Self::Implement,
        Self::SecurityReview,
        Self::CodeReview,
        Self::ResolveVerdict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateSpec => "generate-spec",
            Self::GeneratePlan => "generate-plan",
            Self::GenerateTests => "generate-tests",
            Self::Implement => "implement",
            Self::SecurityReview => "security-review",
            Self::CodeReview => "code-review",
            Self::ResolveVerdict => "resolve-verdict",
        }
    }

    /// The status a job must be in for this step to run. A message whose job
    /// has moved on is a stale redelivery.
    pub fn runs_in(&self) -> JobStatus {
        match self {
            Self::GenerateSpec => JobStatus::SpecGenerating,
            Self::GeneratePlan => JobStatus::PlanGenerating,
            Self::GenerateTests => JobStatus::TestsGenerating,
            Self::Implement => JobStatus::Implementing,
            Self::SecurityReview | Self::CodeReview | Self::ResolveVerdict => JobStatus::Review,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue payload: one step of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMessage {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub job_id: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PipelineMessage {
    pub fn for_job(kind: StepKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            title: Some(job.title.clone()),
        }
    }
}

/// One file produced by the implementation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}
