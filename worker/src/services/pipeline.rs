//! Import pipeline facade
//!
//! Every operation of the import API lives here: upload, configuration, phase
//! enqueueing, cancel/retry, status and review queries. Operations check the job's
//! tenant and lifecycle guards, then apply a single conditional write. The parse and
//! commit workers are reached through the queue (`PhaseRunner`).

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::active_jobs::ActiveJobs;
use super::assignment::validate_assignment;
use super::auto_mapper::AutoMapper;
use super::commit_worker;
use super::file_reader::{detect_kind, preview};
use super::object_storage::{content_hash, import_locator, ObjectStorage};
use super::parse_worker;
use super::progress::ProgressHub;
use super::queue::{PhaseMessage, PhaseQueue, PhaseRunner};
use super::state_machine::{
    can_transition, parse_starts_from_scratch, require, status_after_config_change, CANCELLABLE,
    COMMIT_ENQUEUEABLE, CONFIGURABLE, FAILABLE, PARSE_ENQUEUEABLE,
};
use super::store::{ImportStore, JobChange, OwnerDirectory};
use crate::auth::AuthInfo;
use crate::config::ImportSettings;
use crate::defaults::{FILE_URL_TTL_SECONDS, SAMPLE_ROWS};
use crate::error::{ImportError, ImportResult};
use crate::types::{
    AssignmentConfig, ColumnMapping, CreateImportJobResponse, DuplicateConfig, DuplicatePreview,
    DuplicateStrategy, FileDescriptor, FileUrlResponse, GetRowsResponse, ImportJob, ImportJobStatus,
    ImportOptions, ImportPhase, JobCounters, JobCursor, JobError, JobStatusResponse, NewImportJob, Page,
    ProgressSnapshot, RowFilter, WizardState,
};

/// Collaborators shared by the pipeline and its workers
#[derive(Clone)]
pub struct ImportContext {
    pub store: Arc<dyn ImportStore>,
    pub storage: Arc<dyn ObjectStorage>,
    pub directory: Arc<dyn OwnerDirectory>,
    pub queue: Arc<dyn PhaseQueue>,
    pub progress: Arc<ProgressHub>,
    pub active_jobs: ActiveJobs,
    pub settings: ImportSettings,
}

impl ImportContext {
    /// Record a worker-level failure; checkpoints written so far are kept
    pub async fn fail_phase(&self, job_id: Uuid, phase: ImportPhase, err: &anyhow::Error) -> Result<()> {
        error!("{} phase of job {} failed: {:#}", phase.as_str(), job_id, err);

        let error = JobError {
            message: err.to_string(),
            detail: serde_json::json!({
                "phase": phase.as_str(),
                "cause": format!("{:#}", err),
            }),
        };

        let job = self
            .store
            .update_job(
                job_id,
                FAILABLE,
                JobChange {
                    status: Some(ImportJobStatus::Failed),
                    error: Some(Some(error)),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(job) = job {
            self.progress.publish(job.snapshot()).await;
        }
        Ok(())
    }
}

pub struct ImportPipeline {
    ctx: ImportContext,
}

impl ImportPipeline {
    pub fn new(ctx: ImportContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ImportContext {
        &self.ctx
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Store an uploaded file and create its job with a suggested mapping.
    /// Uploading the same bytes again for the same tenant returns the existing job.
    pub async fn create_import_job(
        &self,
        auth: &AuthInfo,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> ImportResult<CreateImportJobResponse> {
        let settings = &self.ctx.settings;
        if bytes.is_empty() {
            return Err(ImportError::UnsupportedFile("file is empty".to_string()));
        }
        if bytes.len() > settings.max_upload_bytes {
            return Err(ImportError::UnsupportedFile(format!(
                "file exceeds the {} byte upload limit",
                settings.max_upload_bytes
            )));
        }

        let kind = detect_kind(file_name, content_type, &bytes)?;
        let hash = content_hash(&bytes);
        let owner_id = auth.data_user_id();

        if let Some(existing) = self.ctx.store.find_job_by_hash(owner_id, &hash).await? {
            info!("Re-upload of {} matches job {}", file_name, existing.id);
            return Ok(create_response(existing, true));
        }

        let bytes: Arc<[u8]> = Arc::from(bytes);
        let preview_bytes = Arc::clone(&bytes);
        let (headers, samples) = tokio::task::spawn_blocking(move || {
            preview(kind, Box::new(Cursor::new(preview_bytes)), SAMPLE_ROWS)
        })
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| ImportError::UnsupportedFile(format!("{:#}", e)))?;

        if headers.is_empty() {
            return Err(ImportError::UnsupportedFile("file has no header row".to_string()));
        }

        let mapping = AutoMapper::new(settings.min_confidence)
            .with_extra_aliases(&settings.extra_aliases)
            .suggest(&headers, &samples);

        let job_id = Uuid::new_v4();
        let locator = import_locator(owner_id, job_id, file_name);
        self.ctx.storage.put(&locator, &bytes).await?;

        let new_job = NewImportJob {
            id: job_id,
            owner_id,
            created_by: auth.user_id,
            file: FileDescriptor {
                name: file_name.to_string(),
                kind,
                size_bytes: bytes.len() as i64,
                storage_locator: locator.clone(),
                content_hash: hash.clone(),
            },
            headers,
            mapping,
        };

        match self.ctx.store.insert_job(&new_job).await? {
            Some(job) => {
                info!(
                    "Created import job {} for {} ({} columns, {} mapped)",
                    job.id,
                    file_name,
                    job.headers.len(),
                    job.mapping.summary().mapped_columns
                );
                self.ctx.progress.publish(job.snapshot()).await;
                Ok(create_response(job, false))
            }
            None => {
                // lost a race with a concurrent upload of the same file
                if let Err(e) = self.ctx.storage.delete(&locator).await {
                    warn!("Failed to remove orphaned upload {}: {}", locator, e);
                }
                let existing = self
                    .ctx
                    .store
                    .find_job_by_hash(owner_id, &hash)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Job for content {} vanished", hash))?;
                Ok(create_response(existing, true))
            }
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn set_column_mapping(
        &self,
        auth: &AuthInfo,
        job_id: Uuid,
        mapping: ColumnMapping,
    ) -> ImportResult<ImportJob> {
        const OP: &str = "setColumnMapping";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, CONFIGURABLE)?;

        mapping.validate()?;
        for entry in mapping.entries() {
            match job.headers.get(entry.source_index) {
                Some(header) if *header == entry.source_column => {}
                _ => {
                    return Err(ImportError::InvalidConfig(format!(
                        "Column '{}' is not at position {} of the file",
                        entry.source_column, entry.source_index
                    )))
                }
            }
        }

        let status = status_after_config_change(job.status, job.mapping != mapping);
        let change = JobChange {
            status: Some(status),
            mapping: Some(mapping),
            ..Default::default()
        };
        self.apply(OP, &job, CONFIGURABLE, change).await
    }

    pub async fn set_options(
        &self,
        auth: &AuthInfo,
        job_id: Uuid,
        assignment: AssignmentConfig,
        duplicates: DuplicateConfig,
    ) -> ImportResult<ImportJob> {
        const OP: &str = "setOptions";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, CONFIGURABLE)?;

        self.validate_options(&job, &assignment, &duplicates).await?;

        let status = status_after_config_change(job.status, job.duplicates.affects_parse(&duplicates));
        let change = JobChange {
            status: Some(status),
            assignment: Some(assignment),
            duplicates: Some(duplicates),
            ..Default::default()
        };
        self.apply(OP, &job, CONFIGURABLE, change).await
    }

    async fn validate_options(
        &self,
        job: &ImportJob,
        assignment: &AssignmentConfig,
        duplicates: &DuplicateConfig,
    ) -> ImportResult<()> {
        let owners = self.ctx.directory.list_owners(job.owner_id).await?;
        validate_assignment(assignment, &owners, &job.headers)?;

        if duplicates.check_fields.is_empty() {
            return Err(ImportError::InvalidConfig(
                "At least one duplicate check field is required".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn save_ui_state(&self, auth: &AuthInfo, job_id: Uuid, ui_state: WizardState) -> ImportResult<ImportJob> {
        let job = self.load_job(auth, job_id).await?;
        let change = JobChange {
            ui_state: Some(ui_state),
            ..Default::default()
        };
        self.apply("saveUiState", &job, &ImportJobStatus::ALL, change).await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// Queue the parse phase. From `pending`/`validating` parsing starts over; from
    /// `failed`/`parsing` it resumes after the last checkpoint.
    pub async fn enqueue_parse(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<JobStatusResponse> {
        const OP: &str = "enqueueParse";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, PARSE_ENQUEUEABLE)?;

        if !job.mapping.has_identity_field() {
            return Err(ImportError::MappingIncomplete);
        }
        if job.status == ImportJobStatus::Failed && job.last_phase == Some(ImportPhase::Commit) {
            return Err(ImportError::invalid_state(OP, job.status));
        }
        if job.status == ImportJobStatus::Parsing && self.ctx.active_jobs.is_active(&job_id) {
            return Err(ImportError::invalid_state(OP, job.status));
        }

        let mut change = JobChange {
            status: Some(ImportJobStatus::Queued),
            last_phase: Some(ImportPhase::Parse),
            error: Some(None),
            ..Default::default()
        };
        let from_scratch = parse_starts_from_scratch(job.status);
        if from_scratch {
            change.counters = Some(JobCounters::default());
            change.cursor = Some(JobCursor::default());
        }

        let job = self.apply_with(OP, &job, &[job.status], change, from_scratch).await?;
        self.enqueue(&job, ImportPhase::Parse).await
    }

    /// Queue the commit phase, optionally replacing the options first
    pub async fn enqueue_commit(
        &self,
        auth: &AuthInfo,
        job_id: Uuid,
        options: Option<ImportOptions>,
    ) -> ImportResult<JobStatusResponse> {
        const OP: &str = "enqueueCommit";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, COMMIT_ENQUEUEABLE)?;

        let options = match options {
            Some(options) => {
                self.validate_options(&job, &options.assignment, &options.duplicates).await?;
                if job.duplicates.affects_parse(&options.duplicates) {
                    return Err(ImportError::InvalidConfig(
                        "Duplicate check settings differ from the parsed rows; set options and re-parse first"
                            .to_string(),
                    ));
                }
                options
            }
            None => job.options(),
        };

        let batch_size = self.ctx.settings.batch_size.max(1) as i64;
        let counters = JobCounters {
            imported: 0,
            updated: 0,
            skipped: 0,
            db_duplicates: 0,
            ..job.counters
        };
        let estimate = (counters.valid + batch_size - 1) / batch_size;

        let change = JobChange {
            status: Some(ImportJobStatus::Queued),
            last_phase: Some(ImportPhase::Commit),
            assignment: Some(options.assignment),
            duplicates: Some(options.duplicates),
            counters: Some(counters),
            cursor: Some(JobCursor::new(0, estimate)),
            error: Some(None),
            ..Default::default()
        };
        let job = self.apply(OP, &job, COMMIT_ENQUEUEABLE, change).await?;
        self.enqueue(&job, ImportPhase::Commit).await
    }

    /// Request cancellation; workers observe it at their next checkpoint
    pub async fn cancel(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<JobStatusResponse> {
        const OP: &str = "cancel";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, CANCELLABLE)?;

        let change = JobChange {
            status: Some(ImportJobStatus::Cancelled),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        let job = self.apply(OP, &job, CANCELLABLE, change).await?;
        if let Some(phase) = self.ctx.active_jobs.running_phase(&job_id) {
            self.ctx.active_jobs.cancel(&job_id);
            info!("Signalled running {} worker of job {} to stop", phase.as_str(), job_id);
        }
        info!("Import job {} cancelled", job_id);

        Ok(JobStatusResponse {
            job_id,
            status: job.status,
        })
    }

    /// Re-enqueue the failed phase; it resumes from the persisted cursor
    pub async fn retry(&self, auth: &AuthInfo, job_id: Uuid, phase: ImportPhase) -> ImportResult<JobStatusResponse> {
        const OP: &str = "retry";
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, &[ImportJobStatus::Failed])?;

        let last_phase = job.last_phase.unwrap_or(ImportPhase::Parse);
        if phase != last_phase {
            return Err(ImportError::InvalidConfig(format!(
                "Job failed during {}, not {}",
                last_phase.as_str(),
                phase.as_str()
            )));
        }
        if phase == ImportPhase::Parse && !job.mapping.has_identity_field() {
            return Err(ImportError::MappingIncomplete);
        }

        let change = JobChange {
            status: Some(ImportJobStatus::Queued),
            last_phase: Some(phase),
            error: Some(None),
            ..Default::default()
        };
        let job = self.apply(OP, &job, &[ImportJobStatus::Failed], change).await?;
        info!("Retrying {} phase of job {}", phase.as_str(), job_id);
        self.enqueue(&job, phase).await
    }

    async fn enqueue(&self, job: &ImportJob, phase: ImportPhase) -> ImportResult<JobStatusResponse> {
        let message = PhaseMessage::new(job.id, phase);
        if let Err(e) = self.ctx.queue.enqueue(&message).await {
            self.ctx.fail_phase(job.id, phase, &e).await?;
            return Err(ImportError::Internal(e));
        }

        info!("Queued {} phase of job {}", phase.as_str(), job.id);

        Ok(JobStatusResponse {
            job_id: job.id,
            status: job.status,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_job(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<ImportJob> {
        self.load_job(auth, job_id).await
    }

    pub async fn poll_status(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<ProgressSnapshot> {
        Ok(self.load_job(auth, job_id).await?.snapshot())
    }

    /// Live snapshots until the job reaches a terminal state
    pub async fn subscribe_progress(
        &self,
        auth: &AuthInfo,
        job_id: Uuid,
    ) -> ImportResult<BoxStream<'static, ProgressSnapshot>> {
        let job = self.load_job(auth, job_id).await?;
        let stream = self.ctx.progress.subscribe(job.snapshot());

        // the job may have finished between the read and the subscription
        match self.ctx.store.get_job(job_id).await? {
            Some(latest) if latest.status.is_terminal() && !job.status.is_terminal() => {
                let snapshot = latest.snapshot();
                Ok(stream::once(async move { snapshot }).boxed())
            }
            _ => Ok(stream),
        }
    }

    pub async fn get_rows(
        &self,
        auth: &AuthInfo,
        job_id: Uuid,
        filter: Option<RowFilter>,
        page: Page,
    ) -> ImportResult<GetRowsResponse> {
        self.load_job(auth, job_id).await?;
        let (rows, total_count) = self.ctx.store.list_rows(job_id, filter, page).await?;
        Ok(GetRowsResponse { rows, total_count })
    }

    /// Duplicate pre-check before commit: flags store duplicates and reports counts
    pub async fn preview(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<DuplicatePreview> {
        let job = self.load_job(auth, job_id).await?;
        require("preview", job.status, &[ImportJobStatus::Ready])?;

        let db_duplicates = commit_worker::mark_store_duplicates(&self.ctx, &job).await?;
        let counters = job.counters;

        let mut commit_eligible = counters.valid - counters.file_duplicates;
        if job.duplicates.strategy == DuplicateStrategy::Skip {
            commit_eligible -= db_duplicates;
        }

        Ok(DuplicatePreview {
            valid: counters.valid,
            invalid: counters.invalid,
            file_duplicates: counters.file_duplicates,
            db_duplicates,
            commit_eligible: commit_eligible.max(0),
        })
    }

    pub async fn get_file_url(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<FileUrlResponse> {
        let job = self.load_job(auth, job_id).await?;
        let expires_at = Utc::now() + Duration::seconds(FILE_URL_TTL_SECONDS);
        let url = self.ctx.storage.signed_url(&job.file.storage_locator, expires_at);
        Ok(FileUrlResponse { url, expires_at })
    }

    /// Delete a finished job, its rows and its stored file
    pub async fn delete_job(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<JobStatusResponse> {
        const OP: &str = "deleteJob";
        const TERMINAL: &[ImportJobStatus] = &[
            ImportJobStatus::Completed,
            ImportJobStatus::Failed,
            ImportJobStatus::Cancelled,
        ];
        let job = self.load_job(auth, job_id).await?;
        require(OP, job.status, TERMINAL)?;
        if self.ctx.active_jobs.is_active(&job_id) {
            return Err(ImportError::invalid_state(OP, job.status));
        }

        if !self.ctx.store.delete_job(job_id, TERMINAL).await? {
            let current = self.ctx.store.get_job(job_id).await?.ok_or(ImportError::NotFound(job_id))?;
            return Err(ImportError::invalid_state(OP, current.status));
        }
        if let Err(e) = self.ctx.storage.delete(&job.file.storage_locator).await {
            warn!("Failed to delete stored file of job {}: {}", job_id, e);
        }
        info!("Deleted import job {}", job_id);

        Ok(JobStatusResponse {
            job_id,
            status: job.status,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Load a job of the caller's tenant; other tenants' jobs do not exist for them
    async fn load_job(&self, auth: &AuthInfo, job_id: Uuid) -> ImportResult<ImportJob> {
        match self.ctx.store.get_job(job_id).await? {
            Some(job) if job.owner_id == auth.data_user_id() => Ok(job),
            _ => Err(ImportError::NotFound(job_id)),
        }
    }

    /// Conditional write; a concurrent status change surfaces as `InvalidState`
    async fn apply(
        &self,
        operation: &'static str,
        job: &ImportJob,
        expected: &[ImportJobStatus],
        change: JobChange,
    ) -> ImportResult<ImportJob> {
        self.apply_with(operation, job, expected, change, false).await
    }

    /// Guarded conditional write; with `discard_rows` the job's parsed rows are dropped
    /// in the same step, and only when the write applies.
    async fn apply_with(
        &self,
        operation: &'static str,
        job: &ImportJob,
        expected: &[ImportJobStatus],
        change: JobChange,
        discard_rows: bool,
    ) -> ImportResult<ImportJob> {
        if let Some(to) = change.status {
            if to != job.status && !can_transition(job.status, to) {
                return Err(ImportError::invalid_state(operation, job.status));
            }
        }

        let updated = if discard_rows {
            self.ctx
                .store
                .restart_job(job.id, expected, change)
                .await?
                .map(|(updated, removed)| {
                    if removed > 0 {
                        info!("Discarded {} parsed rows of job {}", removed, job.id);
                    }
                    updated
                })
        } else {
            self.ctx.store.update_job(job.id, expected, change).await?
        };

        match updated {
            Some(updated) => {
                if updated.status != job.status {
                    self.ctx.progress.publish(updated.snapshot()).await;
                }
                Ok(updated)
            }
            None => {
                let current = self
                    .ctx
                    .store
                    .get_job(job.id)
                    .await?
                    .ok_or(ImportError::NotFound(job.id))?;
                Err(ImportError::invalid_state(operation, current.status))
            }
        }
    }
}

fn create_response(job: ImportJob, existing: bool) -> CreateImportJobResponse {
    let summary = job.mapping.summary();
    CreateImportJobResponse {
        job_id: job.id,
        storage_locator: job.file.storage_locator,
        existing,
        headers: job.headers,
        mapping: job.mapping,
        summary,
    }
}

#[async_trait]
impl PhaseRunner for ImportPipeline {
    async fn run_phase(&self, message: PhaseMessage) -> Result<()> {
        match message.phase {
            ImportPhase::Parse => parse_worker::run(&self.ctx, message.job_id).await,
            ImportPhase::Commit => commit_worker::run(&self.ctx, message.job_id).await,
        }
    }
}
