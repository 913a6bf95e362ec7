//! Persistence seam of the pipeline
//!
//! `ImportStore` is everything the workers and the pipeline need from the relational
//! store. Every job write is conditional on the job's current status (and, for
//! checkpoints, on the cursor) so concurrent cancel requests and redelivered queue
//! messages can never move a job backwards or apply a chunk twice.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::types::{
    AssignmentConfig, AuditEvent, ColumnMapping, Contact, ContactDraft, DuplicateConfig, ImportJob,
    ImportJobStatus, ImportPhase, ImportRow, JobCounters, JobCursor, JobError, NewImportJob,
    NewImportRow, Owner, Page, RowFilter, RowStatus, WizardState,
};

/// Partial update of a job; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct JobChange {
    pub status: Option<ImportJobStatus>,
    pub last_phase: Option<ImportPhase>,
    pub mapping: Option<ColumnMapping>,
    pub assignment: Option<AssignmentConfig>,
    pub duplicates: Option<DuplicateConfig>,
    pub counters: Option<JobCounters>,
    pub cursor: Option<JobCursor>,
    /// `Some(None)` clears the recorded error
    pub error: Option<Option<JobError>>,
    pub ui_state: Option<WizardState>,
    /// Only set when not already set
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobChange {
    pub fn status(status: ImportJobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// One parse chunk: the rows and the job state after them
#[derive(Debug, Clone)]
pub struct ParseCheckpoint {
    /// 1-based; the job cursor must sit at `chunk_number - 1`
    pub chunk_number: i64,
    pub rows: Vec<NewImportRow>,
    pub counters: JobCounters,
    pub cursor: JobCursor,
}

/// What the commit does with one valid row
#[derive(Debug, Clone, PartialEq)]
pub enum RowAction {
    Create { contact_id: Uuid, draft: ContactDraft },
    Update { contact_id: Uuid, draft: ContactDraft },
    Skip { reason: String },
}

impl RowAction {
    /// Status the row moves to when the action is applied
    pub fn row_status(&self) -> RowStatus {
        match self {
            RowAction::Create { .. } | RowAction::Update { .. } => RowStatus::Imported,
            RowAction::Skip { .. } => RowStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    pub row_number: i64,
    pub action: RowAction,
    /// Written in the same transaction as the row, only when the row is applied
    pub event: Option<AuditEvent>,
}

/// One commit batch: entity writes, row outcomes, audit events and the job state after them
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// 1-based; the job cursor must sit at `batch_number - 1`
    pub batch_number: i64,
    pub outcomes: Vec<RowOutcome>,
    pub counters: JobCounters,
    pub cursor: JobCursor,
}

#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Insert a job; `None` when the owner already uploaded the same content
    async fn insert_job(&self, job: &NewImportJob) -> Result<Option<ImportJob>>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>>;

    async fn find_job_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<ImportJob>>;

    /// Apply `change` if the job is in one of `expected`; returns the updated job
    async fn update_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<ImportJob>>;

    /// Delete a job in one of `expected` together with its rows
    async fn delete_job(&self, job_id: Uuid, expected: &[ImportJobStatus]) -> Result<bool>;

    /// Like `update_job`, and when it applies also drop all parsed rows of the job in
    /// the same atomic step. Returns the updated job and the number of rows removed.
    async fn restart_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<(ImportJob, u64)>>;

    /// Upsert a chunk of rows and advance the job in one atomic step.
    /// Returns `None` (and writes nothing) unless the job is parsing with its cursor
    /// right before this chunk.
    async fn checkpoint_parse(&self, job_id: Uuid, checkpoint: &ParseCheckpoint) -> Result<Option<ImportJob>>;

    /// Dedupe keys of rows that passed validation
    async fn row_dedupe_keys(&self, job_id: Uuid) -> Result<HashSet<String>>;

    /// Flag valid rows whose key is in `matches` as store duplicates and clear stale
    /// flags. File duplicates keep their classification. Returns the number of rows
    /// flagged as store duplicates afterwards.
    async fn mark_db_duplicates(&self, job_id: Uuid, matches: &HashMap<String, Uuid>) -> Result<i64>;

    /// Valid rows after `after_row_number`, ordered by row number
    async fn valid_rows_after(&self, job_id: Uuid, after_row_number: i64, limit: i64) -> Result<Vec<ImportRow>>;

    /// Write entities, row outcomes and their audit events and advance the job in one
    /// atomic step.
    /// Returns `None` (and writes nothing) unless the job is importing with its cursor
    /// right before this batch.
    async fn checkpoint_commit(&self, job: &ImportJob, batch: &CommitBatch) -> Result<Option<ImportJob>>;

    async fn list_rows(&self, job_id: Uuid, filter: Option<RowFilter>, page: Page) -> Result<(Vec<ImportRow>, i64)>;

    /// Keyset page over the tenant's contacts, skipping those created by `exclude_job`
    async fn contacts_page(
        &self,
        owner_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
        exclude_job: Uuid,
    ) -> Result<Vec<Contact>>;
}

/// Read-only view of the users contacts can be assigned to
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn list_owners(&self, tenant_id: Uuid) -> Result<Vec<Owner>>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// PostgreSQL-backed store and owner directory
#[derive(Clone)]
pub struct PgImportStore {
    pool: PgPool,
}

impl PgImportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImportStore for PgImportStore {
    async fn insert_job(&self, job: &NewImportJob) -> Result<Option<ImportJob>> {
        queries::import_job::insert_job(&self.pool, job).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ImportJob>> {
        queries::import_job::get_job(&self.pool, job_id).await
    }

    async fn find_job_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<ImportJob>> {
        queries::import_job::find_job_by_hash(&self.pool, owner_id, content_hash).await
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<ImportJob>> {
        queries::import_job::update_job(&self.pool, job_id, expected, &change).await
    }

    async fn delete_job(&self, job_id: Uuid, expected: &[ImportJobStatus]) -> Result<bool> {
        queries::import_job::delete_job(&self.pool, job_id, expected).await
    }

    async fn restart_job(
        &self,
        job_id: Uuid,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> Result<Option<(ImportJob, u64)>> {
        queries::import_job::restart_job(&self.pool, job_id, expected, &change).await
    }

    async fn checkpoint_parse(&self, job_id: Uuid, checkpoint: &ParseCheckpoint) -> Result<Option<ImportJob>> {
        queries::import_row::checkpoint_parse(&self.pool, job_id, checkpoint).await
    }

    async fn row_dedupe_keys(&self, job_id: Uuid) -> Result<HashSet<String>> {
        queries::import_row::dedupe_keys(&self.pool, job_id).await
    }

    async fn mark_db_duplicates(&self, job_id: Uuid, matches: &HashMap<String, Uuid>) -> Result<i64> {
        queries::import_row::mark_db_duplicates(&self.pool, job_id, matches).await
    }

    async fn valid_rows_after(&self, job_id: Uuid, after_row_number: i64, limit: i64) -> Result<Vec<ImportRow>> {
        queries::import_row::valid_rows_after(&self.pool, job_id, after_row_number, limit).await
    }

    async fn checkpoint_commit(&self, job: &ImportJob, batch: &CommitBatch) -> Result<Option<ImportJob>> {
        queries::contact::checkpoint_commit(&self.pool, job, batch).await
    }

    async fn list_rows(&self, job_id: Uuid, filter: Option<RowFilter>, page: Page) -> Result<(Vec<ImportRow>, i64)> {
        queries::import_row::list_rows(&self.pool, job_id, filter, page).await
    }

    async fn contacts_page(
        &self,
        owner_id: Uuid,
        after: Option<Uuid>,
        limit: i64,
        exclude_job: Uuid,
    ) -> Result<Vec<Contact>> {
        queries::contact::contacts_page(&self.pool, owner_id, after, limit, exclude_job).await
    }
}

#[async_trait]
impl OwnerDirectory for PgImportStore {
    async fn list_owners(&self, tenant_id: Uuid) -> Result<Vec<Owner>> {
        queries::owner::list_owners(&self.pool, tenant_id).await
    }
}
