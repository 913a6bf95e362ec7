//! Parse phase: stream the uploaded file into validated import rows
//!
//! Chunks of `chunk_size` rows are validated, classified for within-file duplicates
//! and persisted together with the job counters and cursor as one checkpoint. A
//! resumed run continues after the last persisted row number, whatever chunk size
//! the earlier run used, and rebuilds the seen-key set from persisted rows.
//! Cancellation is observed between chunks.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::active_jobs::JobGuard;
use super::duplicates::{dedupe_key, WithinFileDetector};
use super::file_reader::{count_rows, ChunkReader, RawChunk, SheetReader};
use super::normalizer::RowValidator;
use super::pipeline::ImportContext;
use super::state_machine::{running_status, worker_start_states};
use super::store::{JobChange, ParseCheckpoint};
use crate::types::{
    DuplicateKind, ImportJob, ImportJobStatus, ImportPhase, JobCounters, JobCursor, NewImportRow, RawRecord,
    TargetField,
};

/// Run the parse phase of a job delivered by the queue
pub async fn run(ctx: &ImportContext, job_id: Uuid) -> Result<()> {
    let Some(guard) = ctx.active_jobs.register(job_id, ImportPhase::Parse) else {
        info!("Parse of job {} already running in this process, skipping delivery", job_id);
        return Ok(());
    };

    let Some(job) = ctx.store.get_job(job_id).await? else {
        warn!("Parse requested for unknown job {}", job_id);
        return Ok(());
    };

    if !worker_start_states(ImportPhase::Parse).contains(&job.status) {
        info!("Job {} is {}, nothing to parse", job_id, job.status);
        return Ok(());
    }

    match parse_job(ctx, &guard, job).await {
        Ok(()) => Ok(()),
        Err(e) => ctx.fail_phase(job_id, ImportPhase::Parse, &e).await,
    }
}

async fn parse_job(ctx: &ImportContext, guard: &JobGuard, job: ImportJob) -> Result<()> {
    let job_id = job.id;
    let settings = &ctx.settings;
    let chunk_size = settings.chunk_size.max(1);

    let kind = job.file.kind;
    let reader = ctx.storage.open_reader(&job.file.storage_locator).await?;
    let total = tokio::task::spawn_blocking(move || count_rows(kind, reader)).await??;
    if total == 0 {
        bail!("File contains no data rows");
    }

    let done = job.cursor.position;
    let remaining = (total - job.counters.parsed()).max(0);
    let estimate = done + (remaining + chunk_size as i64 - 1) / chunk_size as i64;
    let counters = JobCounters { total, ..job.counters };
    let cursor = JobCursor {
        last_row_number: job.cursor.last_row_number,
        ..JobCursor::new(done, estimate)
    };

    let Some(job) = ctx
        .store
        .update_job(
            job_id,
            worker_start_states(ImportPhase::Parse),
            JobChange {
                status: Some(running_status(ImportPhase::Parse)),
                counters: Some(counters),
                cursor: Some(cursor),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?
    else {
        info!("Job {} left the parse queue before it started", job_id);
        return Ok(());
    };
    ctx.progress.publish(job.snapshot()).await;

    info!(
        "Parsing job {} ({} rows, {} chunks, resuming after chunk {} at row {})",
        job_id, total, estimate, job.cursor.position, job.cursor.last_row_number
    );

    let detector = if job.duplicates.check_within_file {
        WithinFileDetector::from_keys(ctx.store.row_dedupe_keys(job_id).await?)
    } else {
        WithinFileDetector::new(false)
    };
    let mut parser = ChunkParser {
        validator: RowValidator::new(settings.phone_country_code.clone()),
        detector,
        check_fields: job.duplicates.check_fields.clone(),
        estimate,
    };

    let reader = ctx.storage.open_reader(&job.file.storage_locator).await?;
    let (completed, last_row_number) = (job.cursor.position, job.cursor.last_row_number);
    let mut chunks = tokio::task::spawn_blocking(move || -> Result<ChunkReader> {
        let mut chunks = ChunkReader::new(SheetReader::open(kind, reader)?, chunk_size);
        chunks.resume_after(completed, last_row_number)?;
        Ok(chunks)
    })
    .await??;

    let mut counters = job.counters;
    let mut position = job.cursor.position;
    loop {
        if guard.is_cancelled() {
            info!("Parse of job {} cancelled after chunk {}", job_id, position);
            return Ok(());
        }

        let (returned, next) = tokio::task::spawn_blocking(move || {
            let next = chunks.next_chunk();
            (chunks, next)
        })
        .await?;
        chunks = returned;
        let Some(chunk) = next? else {
            break;
        };

        let checkpoint = parser.checkpoint(&job, chunk, &mut counters);

        match ctx.store.checkpoint_parse(job_id, &checkpoint).await? {
            Some(updated) => {
                position = checkpoint.chunk_number;
                debug!("Job {} chunk {}/{} persisted", job_id, position, estimate);
                ctx.progress.publish(updated.snapshot()).await;
            }
            None => {
                info!(
                    "Job {} no longer accepts chunk {}, stopping parse",
                    job_id, checkpoint.chunk_number
                );
                return Ok(());
            }
        }
    }

    if let Some(job) = ctx
        .store
        .update_job(
            job_id,
            &[ImportJobStatus::Parsing],
            JobChange::status(ImportJobStatus::Ready),
        )
        .await?
    {
        info!(
            "Parsed job {}: {} valid, {} invalid, {} file duplicates",
            job_id, job.counters.valid, job.counters.invalid, job.counters.file_duplicates
        );
        ctx.progress.publish(job.snapshot()).await;
    }

    Ok(())
}

/// Per-run state for turning raw chunks into checkpoints
struct ChunkParser {
    validator: RowValidator,
    detector: WithinFileDetector,
    check_fields: Vec<TargetField>,
    estimate: i64,
}

impl ChunkParser {
    fn checkpoint(&mut self, job: &ImportJob, chunk: RawChunk, counters: &mut JobCounters) -> ParseCheckpoint {
        let mut rows = Vec::with_capacity(chunk.rows.len());
        let last_row_number = chunk.rows.last().map_or(job.cursor.last_row_number, |(n, _)| *n);

        for (row_number, values) in chunk.rows {
            let raw: RawRecord = job.headers.iter().cloned().zip(values).collect();
            let validated = self.validator.validate(&raw, &job.mapping);

            let (key, duplicate) = if validated.is_valid() {
                counters.valid += 1;
                let key = dedupe_key(&validated.normalized, &self.check_fields);
                let duplicate = self.detector.classify(key.as_deref());
                if duplicate == DuplicateKind::FileDuplicate {
                    counters.file_duplicates += 1;
                }
                (key, duplicate)
            } else {
                counters.invalid += 1;
                (None, DuplicateKind::None)
            };

            rows.push(NewImportRow {
                row_number,
                chunk_number: chunk.chunk_number,
                status: validated.status,
                raw,
                normalized: validated.normalized,
                errors: validated.errors,
                duplicate,
                dedupe_key: key,
            });
        }

        ParseCheckpoint {
            chunk_number: chunk.chunk_number,
            rows,
            counters: *counters,
            cursor: JobCursor {
                last_row_number,
                ..JobCursor::new(chunk.chunk_number, self.estimate.max(chunk.chunk_number))
            },
        }
    }
}
