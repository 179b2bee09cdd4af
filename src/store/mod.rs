//! Persistence collaborators.
//!
//! The pipeline only talks to these traits. `sqlite` and `artifacts` hold the
//! implementations used by the binary; `crate::testing` has in-memory ones.

pub mod artifacts;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::StoreError;
use crate::pipeline::models::{Job, JobStatus, JobUpdate};

pub use artifacts::FsArtifactStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, owner_id: &str, title: &str, brief: &str)
    -> Result<Job, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Apply `update` to the job. With `expected` set the write only happens
    /// if the stored status still equals it; otherwise `StatusMismatch`.
    async fn update_job(
        &self,
        id: &str,
        update: &JobUpdate,
        expected: Option<JobStatus>,
    ) -> Result<Job, StoreError>;

    /// Jobs in one of `statuses` whose last update is older than `older_than`.
    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read_secret(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError>;

    async fn write_secret(&self, owner_id: &str, name: &str, value: &str)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// One model call, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub job_id: String,
    pub owner_id: String,
    pub agent: String,
    pub attempt: u32,
    pub success: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

/// Artifact key for one generated file.
pub fn artifact_key(owner_id: &str, job_id: &str, path: &str) -> String {
    format!("{owner_id}/{job_id}/{path}")
}
