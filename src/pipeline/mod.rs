//! The feature pipeline: job model, transitions, model-backed steps and the
//! background sweep.
//!
//! Control flow: a transition in [`state`] writes the job's new status and
//! enqueues a [`models::PipelineMessage`]; the [`dispatcher`] consumes it,
//! runs the step through [`step_runner`] or [`code_runner`], persists the
//! result and enqueues the following step. [`sweep`] fails jobs whose step
//! never finished.

pub mod code_runner;
pub mod dispatcher;
pub mod models;
pub mod prompts;
pub mod state;
pub mod step_runner;
pub mod sweep;
pub mod verdict;

use std::sync::Arc;

use crate::llm::CompletionProvider;
use crate::queue::StepQueue;
use crate::store::{ArtifactStore, AuditSink, JobStore, SecretStore};

pub use dispatcher::StepDispatcher;
pub use state::Transitions;
pub use step_runner::{Agent, StageSettings, StageTable};
pub use sweep::StuckJobSweep;

/// Everything the pipeline reads from or writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn JobStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub audit: Arc<dyn AuditSink>,
    pub queue: Arc<dyn StepQueue>,
    pub provider: Arc<dyn CompletionProvider>,
}
