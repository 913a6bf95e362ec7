//! Commit phase: turn valid rows into contacts
//!
//! The store dedupe index is built once per run, then valid rows are processed in
//! row-number order in batches of `batch_size`. Each batch (contacts, row outcomes,
//! their audit events, counters and cursor) is one checkpoint.
//! Cancellation is observed between batches.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::active_jobs::JobGuard;
use super::assignment::AssignmentEngine;
use super::duplicates::{decide, CommitDecision, StoreDedupeIndex};
use super::pipeline::ImportContext;
use super::state_machine::{running_status, worker_start_states};
use super::store::{CommitBatch, JobChange, RowAction, RowOutcome};
use crate::types::{
    AuditEvent, AuditEventType, ContactDraft, ImportJob, ImportJobStatus, ImportPhase, ImportRow, JobCounters,
    JobCursor, TargetField,
};

/// Run the commit phase of a job delivered by the queue
pub async fn run(ctx: &ImportContext, job_id: Uuid) -> Result<()> {
    let Some(guard) = ctx.active_jobs.register(job_id, ImportPhase::Commit) else {
        info!("Commit of job {} already running in this process, skipping delivery", job_id);
        return Ok(());
    };

    let Some(job) = ctx.store.get_job(job_id).await? else {
        warn!("Commit requested for unknown job {}", job_id);
        return Ok(());
    };

    if !worker_start_states(ImportPhase::Commit).contains(&job.status) {
        info!("Job {} is {}, nothing to commit", job_id, job.status);
        return Ok(());
    }

    match commit_job(ctx, &guard, job_id).await {
        Ok(()) => Ok(()),
        Err(e) => ctx.fail_phase(job_id, ImportPhase::Commit, &e).await,
    }
}

/// Flag valid rows that match a stored contact; returns the job's store-duplicate count.
/// With store checks disabled this only clears stale flags.
pub async fn mark_store_duplicates(ctx: &ImportContext, job: &ImportJob) -> Result<i64> {
    if !job.duplicates.check_database {
        return ctx.store.mark_db_duplicates(job.id, &HashMap::new()).await;
    }

    let job_keys = ctx.store.row_dedupe_keys(job.id).await?;
    let index = StoreDedupeIndex::build(
        ctx.store.as_ref(),
        job.owner_id,
        job.id,
        &job.duplicates.check_fields,
        &job_keys,
        ctx.settings.dedupe_page_size,
    )
    .await?;

    ctx.store.mark_db_duplicates(job.id, index.matches()).await
}

async fn commit_job(ctx: &ImportContext, guard: &JobGuard, job_id: Uuid) -> Result<()> {
    let Some(job) = ctx
        .store
        .update_job(
            job_id,
            worker_start_states(ImportPhase::Commit),
            JobChange {
                status: Some(running_status(ImportPhase::Commit)),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?
    else {
        info!("Job {} left the commit queue before it started", job_id);
        return Ok(());
    };
    ctx.progress.publish(job.snapshot()).await;

    let db_duplicates = mark_store_duplicates(ctx, &job).await?;

    let owners = ctx.directory.list_owners(job.owner_id).await?;
    let engine = AssignmentEngine::new(&job.assignment, &owners);
    let strategy = job.duplicates.strategy;
    let batch_size = ctx.settings.batch_size.max(1);
    let phone_column = job.mapping.source_for(TargetField::Phone).map(str::to_string);

    info!(
        "Committing job {} ({} valid rows, {} store duplicates, strategy {:?}, assignment {}, resuming after batch {})",
        job_id,
        job.counters.valid,
        db_duplicates,
        strategy,
        job.assignment.mode_name(),
        job.cursor.position
    );

    let mut counters = JobCounters {
        db_duplicates,
        ..job.counters
    };
    let mut cursor = job.cursor;

    loop {
        if guard.is_cancelled() {
            info!("Commit of job {} cancelled after batch {}", job_id, cursor.position);
            return Ok(());
        }

        let rows = ctx
            .store
            .valid_rows_after(job_id, cursor.last_row_number, batch_size as i64)
            .await?;
        let Some(last) = rows.last() else {
            break;
        };
        let last_row_number = last.row_number;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in &rows {
            let decision = decide(row.duplicate, row.matched_contact_id, strategy);
            let (action, event) = match decision {
                CommitDecision::Create | CommitDecision::Update(_) => {
                    let assigned_to = engine.resolve(&row.raw, counters.imported);
                    let draft = ContactDraft::from_normalized(&row.normalized, phone_raw(row, phone_column.as_deref()), assigned_to);
                    counters.imported += 1;
                    match decision {
                        CommitDecision::Update(contact_id) => {
                            counters.updated += 1;
                            (
                                RowAction::Update { contact_id, draft },
                                Some(audit_event(&job, contact_id, AuditEventType::ContactUpdated)),
                            )
                        }
                        _ => {
                            let contact_id = Uuid::new_v4();
                            (
                                RowAction::Create { contact_id, draft },
                                Some(audit_event(&job, contact_id, AuditEventType::ContactImported)),
                            )
                        }
                    }
                }
                CommitDecision::Skip(reason) => {
                    counters.skipped += 1;
                    (RowAction::Skip { reason }, None)
                }
            };
            outcomes.push(RowOutcome {
                row_number: row.row_number,
                action,
                event,
            });
        }

        let batch_number = cursor.position + 1;
        let batch = CommitBatch {
            batch_number,
            outcomes,
            counters,
            cursor: JobCursor {
                position: batch_number,
                total_estimate: cursor.total_estimate.max(batch_number),
                last_row_number,
            },
        };

        let Some(updated) = ctx.store.checkpoint_commit(&job, &batch).await? else {
            info!("Job {} no longer accepts batch {}, stopping commit", job_id, batch_number);
            return Ok(());
        };
        cursor = updated.cursor;
        debug!("Job {} batch {}/{} committed", job_id, cursor.position, cursor.total_estimate);
        ctx.progress.publish(updated.snapshot()).await;
    }

    if let Some(job) = ctx
        .store
        .update_job(
            job_id,
            &[ImportJobStatus::Importing],
            JobChange {
                status: Some(ImportJobStatus::Completed),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await?
    {
        info!(
            "Committed job {}: {} imported ({} updated), {} skipped, {} invalid",
            job_id, job.counters.imported, job.counters.updated, job.counters.skipped, job.counters.invalid
        );
        ctx.progress.publish(job.snapshot()).await;
    }

    Ok(())
}

fn phone_raw(row: &ImportRow, phone_column: Option<&str>) -> Option<String> {
    let value = row.raw.get(phone_column?)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn audit_event(job: &ImportJob, entity_id: Uuid, event_type: AuditEventType) -> AuditEvent {
    AuditEvent {
        entity_id,
        job_id: job.id,
        event_type,
        actor_id: job.created_by,
        timestamp: Utc::now(),
    }
}
