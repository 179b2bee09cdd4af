use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::{AuditEntry, AuditSink, JobStore, SecretStore};
use crate::errors::StoreError;
use crate::pipeline::models::{Job, JobField, JobStatus, JobUpdate};

const JOB_COLUMNS: &str = "id, owner_id, title, status, brief, spec_md, plan_md, tests_md, \
     security_review_md, code_review_md, spec_recommendation, plan_recommendation, \
     tests_recommendation, generated_files, warning, error_message, created_at, updated_at";

/// Timestamps are stored as fixed-width UTC RFC 3339 so that string order is
/// time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Async-safe handle to the database.
///
/// Every call runs on tokio's blocking pool so SQLite I/O never holds an
/// async worker thread.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Database) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("database task panicked: {e}")))?
    }
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'drafting',
                    brief TEXT NOT NULL DEFAULT '',
                    spec_md TEXT,
                    plan_md TEXT,
                    tests_md TEXT,
                    security_review_md TEXT,
                    code_review_md TEXT,
                    spec_recommendation TEXT,
                    plan_recommendation TEXT,
                    tests_recommendation TEXT,
                    generated_files TEXT NOT NULL DEFAULT '[]',
                    warning TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS secrets (
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, name)
                );

                CREATE TABLE IF NOT EXISTS agent_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    agent TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    input_tokens INTEGER NOT NULL,
                    output_tokens INTEGER NOT NULL,
                    stop_reason TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at);
                CREATE INDEX IF NOT EXISTS idx_agent_runs_job ON agent_runs(job_id);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO jobs (id, owner_id, title, status, brief, generated_files, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?7)",
            params![
                job.id,
                job.owner_id,
                job.title,
                job.status.as_str(),
                job.brief,
                timestamp(job.created_at),
                timestamp(job.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Single-statement compare-and-swap update. Zero affected rows is
    /// resolved to `NotFound` or `StatusMismatch` by re-reading the row.
    pub fn update_job(
        &self,
        id: &str,
        update: &JobUpdate,
        expected: Option<JobStatus>,
    ) -> Result<Job, StoreError> {
        let mut sets = vec!["updated_at = ?".to_string()];
        let mut values = vec![SqlValue::Text(timestamp(Utc::now()))];

        if let Some(status) = update.status {
            sets.push("status = ?".to_string());
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        for (field, value) in &update.fields {
            sets.push(format!("{} = ?", field.column()));
            values.push(match (field, value) {
                (_, Some(text)) => SqlValue::Text(text.clone()),
                (JobField::Brief, None) => SqlValue::Text(String::new()),
                (_, None) => SqlValue::Null,
            });
        }
        if let Some(files) = &update.generated_files {
            let json = serde_json::to_string(files)
                .map_err(|e| StoreError::Database(e.into()))?;
            sets.push("generated_files = ?".to_string());
            values.push(SqlValue::Text(json));
        }

        let mut sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        values.push(SqlValue::Text(id.to_string()));
        if let Some(expected) = expected {
            sql.push_str(" AND status = ?");
            values.push(SqlValue::Text(expected.as_str().to_string()));
        }

        let changed = self.conn.execute(&sql, params_from_iter(values))?;
        let current = self.get_job(id)?.ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })?;
        if changed == 0 {
            if let Some(expected) = expected {
                return Err(StoreError::StatusMismatch {
                    id: id.to_string(),
                    expected,
                    actual: current.status,
                });
            }
        }
        Ok(current)
    }

    pub fn list_stale(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ({placeholders}) AND updated_at < ? \
             ORDER BY updated_at"
        );
        let mut values: Vec<SqlValue> = statuses
            .iter()
            .map(|s| SqlValue::Text(s.as_str().to_string()))
            .collect();
        values.push(SqlValue::Text(timestamp(older_than)));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), JobRow::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn read_secret(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM secrets WHERE owner_id = ?1 AND name = ?2",
                params![owner_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn write_secret(&self, owner_id: &str, name: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO secrets (owner_id, name, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![owner_id, name, value, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn record_run(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO agent_runs (job_id, owner_id, agent, attempt, success, input_tokens, output_tokens, stop_reason, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.job_id,
                entry.owner_id,
                entry.agent,
                entry.attempt,
                entry.success,
                entry.input_tokens,
                entry.output_tokens,
                entry.stop_reason,
                entry.error,
                timestamp(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn count_runs(&self, job_id: &str) -> Result<u32, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_runs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: String,
    owner_id: String,
    title: String,
    status: String,
    brief: String,
    spec_md: Option<String>,
    plan_md: Option<String>,
    tests_md: Option<String>,
    security_review_md: Option<String>,
    code_review_md: Option<String>,
    spec_recommendation: Option<String>,
    plan_recommendation: Option<String>,
    tests_recommendation: Option<String>,
    generated_files: String,
    warning: Option<String>,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            status: row.get(3)?,
            brief: row.get(4)?,
            spec_md: row.get(5)?,
            plan_md: row.get(6)?,
            tests_md: row.get(7)?,
            security_review_md: row.get(8)?,
            code_review_md: row.get(9)?,
            spec_recommendation: row.get(10)?,
            plan_recommendation: row.get(11)?,
            tests_recommendation: row.get(12)?,
            generated_files: row.get(13)?,
            warning: row.get(14)?,
            error_message: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| StoreError::Database(anyhow::anyhow!(e)))?;
        let generated_files: Vec<String> = serde_json::from_str(&self.generated_files)
            .context("Failed to parse generated_files JSON")
            .map_err(StoreError::Database)?;
        Ok(Job {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            status,
            brief: self.brief,
            spec_md: self.spec_md,
            plan_md: self.plan_md,
            tests_md: self.tests_md,
            security_review_md: self.security_review_md,
            code_review_md: self.code_review_md,
            spec_recommendation: self.spec_recommendation,
            plan_recommendation: self.plan_recommendation,
            tests_recommendation: self.tests_recommendation,
            generated_files,
            warning: self.warning,
            error_message: self.error_message,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{raw}'"))
        .map_err(StoreError::Database)
}

/// SQLite-backed job, secret and audit store.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            db: DbHandle::new(Database::open(path)?),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(Database::open_in_memory()?),
        })
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(
        &self,
        owner_id: &str,
        title: &str,
        brief: &str,
    ) -> Result<Job, StoreError> {
        let job = Job::new(&uuid::Uuid::new_v4().to_string(), owner_id, title, brief);
        let stored = job.clone();
        self.db.call(move |db| db.create_job(&stored)).await?;
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let id = id.to_string();
        self.db.call(move |db| db.get_job(&id)).await
    }

    async fn update_job(
        &self,
        id: &str,
        update: &JobUpdate,
        expected: Option<JobStatus>,
    ) -> Result<Job, StoreError> {
        let id = id.to_string();
        let update = update.clone();
        self.db
            .call(move |db| db.update_job(&id, &update, expected))
            .await
    }

    async fn list_stale(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let statuses = statuses.to_vec();
        self.db
            .call(move |db| db.list_stale(&statuses, older_than))
            .await
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn read_secret(&self, owner_id: &str, name: &str) -> Result<Option<String>, StoreError> {
        let (owner_id, name) = (owner_id.to_string(), name.to_string());
        self.db
            .call(move |db| db.read_secret(&owner_id, &name))
            .await
    }

    async fn write_secret(
        &self,
        owner_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let (owner_id, name, value) = (owner_id.to_string(), name.to_string(), value.to_string());
        self.db
            .call(move |db| db.write_secret(&owner_id, &name, &value))
            .await
    }
}

#[async_trait]
impl AuditSink for SqliteStore {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.db.call(move |db| db.record_run(&entry)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn set_updated_at(db: &Database, id: &str, at: DateTime<Utc>) {
        db.conn
            .execute(
                "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
                params![timestamp(at), id],
            )
            .unwrap();
    }

    #[test]
    fn test_migrations_create_tables() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        let count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs', 'secrets', 'agent_runs')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 3);
        Ok(())
    }

    #[test]
    fn test_create_and_get_job() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        let job = Job::new("j1", "o1", "Add login", "users need to log in");
        db.create_job(&job)?;

        let loaded = db.get_job("j1")?.expect("job exists");
        assert_eq!(loaded.title, "Add login");
        assert_eq!(loaded.status, JobStatus::Drafting);
        assert!(loaded.generated_files.is_empty());
        assert!(db.get_job("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_without_guard_sets_and_clears() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        db.create_job(&Job::new("j1", "o1", "t", "b"))?;

        let job = db.update_job(
            "j1",
            &JobUpdate::to_status(JobStatus::SpecReady)
                .set(JobField::Spec, "# Spec")
                .set(JobField::Error, "boom")
                .files(vec!["src/a.rs".into()]),
            None,
        )?;
        assert_eq!(job.status, JobStatus::SpecReady);
        assert_eq!(job.spec_md.as_deref(), Some("# Spec"));
        assert_eq!(job.generated_files, vec!["src/a.rs".to_string()]);

        let job = db.update_job("j1", &JobUpdate::new().clear(JobField::Error), None)?;
        assert_eq!(job.error_message, None);
        assert_eq!(job.spec_md.as_deref(), Some("# Spec"));
        Ok(())
    }

    #[test]
    fn test_guarded_update_rejects_status_mismatch_without_side_effects() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        db.create_job(&Job::new("j1", "o1", "t", "b"))?;

        let err = db
            .update_job(
                "j1",
                &JobUpdate::to_status(JobStatus::PlanGenerating).set(JobField::Plan, "x"),
                Some(JobStatus::SpecReady),
            )
            .unwrap_err();
        match err {
            StoreError::StatusMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, JobStatus::SpecReady);
                assert_eq!(actual, JobStatus::Drafting);
            }
            other => panic!("Expected StatusMismatch, got {other:?}"),
        }
        let job = db.get_job("j1")?.unwrap();
        assert_eq!(job.status, JobStatus::Drafting);
        assert_eq!(job.plan_md, None);

        let job = db.update_job(
            "j1",
            &JobUpdate::to_status(JobStatus::SpecGenerating),
            Some(JobStatus::Drafting),
        )?;
        assert_eq!(job.status, JobStatus::SpecGenerating);
        Ok(())
    }

    #[test]
    fn test_update_missing_job_is_not_found() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        let err = db
            .update_job("nope", &JobUpdate::new(), Some(JobStatus::Drafting))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref id } if id == "nope"));
        Ok(())
    }

    #[test]
    fn test_list_stale_filters_by_status_and_age() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        let now = Utc::now();
        for (id, status, age_mins) in [
            ("old-impl", JobStatus::Implementing, 15),
            ("fresh-impl", JobStatus::Implementing, 2),
            ("old-gate", JobStatus::SpecReady, 60),
            ("old-review", JobStatus::Review, 30),
        ] {
            db.create_job(&Job::new(id, "o1", "t", "b"))?;
            db.update_job(id, &JobUpdate::to_status(status), None)?;
            set_updated_at(&db, id, now - Duration::minutes(age_mins));
        }

        let stale = db.list_stale(&JobStatus::PROCESSING, now - Duration::minutes(10))?;
        let ids: Vec<&str> = stale.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["old-review", "old-impl"]);
        Ok(())
    }

    #[test]
    fn test_secrets_upsert() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        assert_eq!(db.read_secret("o1", "anthropic_api_key")?, None);
        db.write_secret("o1", "anthropic_api_key", "sk-1")?;
        db.write_secret("o1", "anthropic_api_key", "sk-2")?;
        assert_eq!(
            db.read_secret("o1", "anthropic_api_key")?.as_deref(),
            Some("sk-2")
        );
        assert_eq!(db.read_secret("o2", "anthropic_api_key")?, None);
        Ok(())
    }

    #[test]
    fn test_record_run() -> anyhow::Result<()> {
        let db = Database::open_in_memory()?;
        db.record_run(&AuditEntry {
            job_id: "j1".into(),
            owner_id: "o1".into(),
            agent: "spec".into(),
            attempt: 1,
            success: true,
            input_tokens: 10,
            output_tokens: 20,
            stop_reason: Some("complete".into()),
            error: None,
            created_at: Utc::now(),
        })?;
        assert_eq!(db.count_runs("j1")?, 1);
        assert_eq!(db.count_runs("j2")?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_trait_round_trip_on_blocking_pool() -> anyhow::Result<()> {
        let store = SqliteStore::open_in_memory()?;
        let job = store.create_job("o1", "Add search", "brief").await?;
        let loaded = store.get_job(&job.id).await?.unwrap();
        assert_eq!(loaded.id, job.id);

        let updated = store
            .update_job(
                &job.id,
                &JobUpdate::to_status(JobStatus::SpecGenerating),
                Some(JobStatus::Drafting),
            )
            .await?;
        assert_eq!(updated.status, JobStatus::SpecGenerating);
        assert!(updated.updated_at >= loaded.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("shipwright.db");
        let id = {
            let store = SqliteStore::open(&path)?;
            store.write_secret("o1", "k", "v").await?;
            store.create_job("o1", "t", "b").await?.id
        };
        let store = SqliteStore::open(&path)?;
        assert!(store.get_job(&id).await?.is_some());
        assert_eq!(store.read_secret("o1", "k").await?.as_deref(), Some("v"));
        Ok(())
    }
}
