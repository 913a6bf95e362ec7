//! Import job database queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::services::store::JobChange;
use crate::types::{
    AssignmentConfig, ColumnMapping, DuplicateConfig, FileDescriptor, FileKind, ImportJob,
    ImportJobStatus, ImportPhase, JobCounters, JobCursor, JobError, NewImportJob, WizardState,
};

pub(crate) const JOB_COLUMNS: &str = r#"
    id, owner_id, created_by,
    file_name, file_kind, file_size_bytes, storage_locator, content_hash,
    status, last_phase, headers, mapping, assignment, duplicates,
    total_rows, valid_rows, invalid_rows, imported_rows, updated_rows, skipped_rows,
    file_duplicates, db_duplicates,
    cursor_position, cursor_total_estimate, cursor_last_row_number,
    error_message, error_detail, ui_state,
    created_at, started_at, completed_at, updated_at
"#;

/// Flat row of `import_jobs`
#[derive(Debug, FromRow)]
pub(crate) struct ImportJobRecord {
    id: Uuid,
    owner_id: Uuid,
    created_by: Uuid,
    file_name: String,
    file_kind: FileKind,
    file_size_bytes: i64,
    storage_locator: String,
    content_hash: String,
    status: ImportJobStatus,
    last_phase: Option<ImportPhase>,
    headers: Json<Vec<String>>,
    mapping: Json<ColumnMapping>,
    assignment: Json<AssignmentConfig>,
    duplicates: Json<DuplicateConfig>,
    total_rows: i64,
    valid_rows: i64,
    invalid_rows: i64,
    imported_rows: i64,
    updated_rows: i64,
    skipped_rows: i64,
    file_duplicates: i64,
    db_duplicates: i64,
    cursor_position: i64,
    cursor_total_estimate: i64,
    cursor_last_row_number: i64,
    error_message: Option<String>,
    error_detail: Option<Json<serde_json::Value>>,
    ui_state: Json<WizardState>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<ImportJobRecord> for ImportJob {
    fn from(r: ImportJobRecord) -> Self {
        ImportJob {
            id: r.id,
            owner_id: r.owner_id,
            created_by: r.created_by,
            file: FileDescriptor {
                name: r.file_name,
                kind: r.file_kind,
                size_bytes: r.file_size_bytes,
                storage_locator: r.storage_locator,
                content_hash: r.content_hash.trim().to_string(),
            },
            status: r.status,
            last_phase: r.last_phase,
            headers: r.headers.0,
            mapping: r.mapping.0,
            assignment: r.assignment.0,
            duplicates: r.duplicates.0,
            counters: JobCounters {
                total: r.total_rows,
                valid: r.valid_rows,
                invalid: r.invalid_rows,
                imported: r.imported_rows,
                updated: r.updated_rows,
                skipped: r.skipped_rows,
                file_duplicates: r.file_duplicates,
                db_duplicates: r.db_duplicates,
            },
            cursor: JobCursor {
                position: r.cursor_position,
                total_estimate: r.cursor_total_estimate,
                last_row_number: r.cursor_last_row_number,
            },
            error: r.error_message.map(|message| JobError {
                message,
                detail: r.error_detail.map(|d| d.0).unwrap_or(serde_json::Value::Null),
            }),
            ui_state: r.ui_state.0,
            created_at: r.created_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
            updated_at: r.updated_at,
        }
    }
}

pub(crate) fn status_names(statuses: &[ImportJobStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

/// Insert a new job. Returns `None` when the (owner, content hash) pair already exists.
pub async fn insert_job(pool: &PgPool, job: &NewImportJob) -> Result<Option<ImportJob>> {
    let sql = format!(
        r#"
        INSERT INTO import_jobs (
            id, owner_id, created_by,
            file_name, file_kind, file_size_bytes, storage_locator, content_hash,
            status, headers, mapping, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, NOW(), NOW())
        ON CONFLICT (owner_id, content_hash) DO NOTHING
        RETURNING {JOB_COLUMNS}
        "#
    );

    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(job.id)
        .bind(job.owner_id)
        .bind(job.created_by)
        .bind(&job.file.name)
        .bind(job.file.kind)
        .bind(job.file.size_bytes)
        .bind(&job.file.storage_locator)
        .bind(&job.file.content_hash)
        .bind(Json(&job.headers))
        .bind(Json(&job.mapping))
        .fetch_optional(pool)
        .await?;

    Ok(record.map(ImportJob::from))
}

/// Get job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<ImportJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    Ok(record.map(ImportJob::from))
}

/// Get job by owner and file content hash
pub async fn find_job_by_hash(pool: &PgPool, owner_id: Uuid, content_hash: &str) -> Result<Option<ImportJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE owner_id = $1 AND content_hash = $2");
    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(pool)
        .await?;

    Ok(record.map(ImportJob::from))
}

/// Conditional partial update; matches only when the status is one of `expected`
pub async fn update_job(
    pool: &PgPool,
    job_id: Uuid,
    expected: &[ImportJobStatus],
    change: &JobChange,
) -> Result<Option<ImportJob>> {
    let mut conn = pool.acquire().await?;
    update_job_on(&mut conn, job_id, expected, change).await
}

/// Conditional update that also drops the job's parsed rows, in one transaction.
/// Nothing is deleted when the status does not match.
pub async fn restart_job(
    pool: &PgPool,
    job_id: Uuid,
    expected: &[ImportJobStatus],
    change: &JobChange,
) -> Result<Option<(ImportJob, u64)>> {
    let mut tx = pool.begin().await?;

    let Some(job) = update_job_on(&mut tx, job_id, expected, change).await? else {
        tx.rollback().await?;
        return Ok(None);
    };

    let removed = sqlx::query("DELETE FROM import_rows WHERE job_id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(Some((job, removed)))
}

async fn update_job_on(
    conn: &mut PgConnection,
    job_id: Uuid,
    expected: &[ImportJobStatus],
    change: &JobChange,
) -> Result<Option<ImportJob>> {
    let sql = format!(
        r#"
        UPDATE import_jobs SET
            status = COALESCE($3, status),
            last_phase = COALESCE($4, last_phase),
            mapping = COALESCE($5, mapping),
            assignment = COALESCE($6, assignment),
            duplicates = COALESCE($7, duplicates),
            total_rows = COALESCE($8, total_rows),
            valid_rows = COALESCE($9, valid_rows),
            invalid_rows = COALESCE($10, invalid_rows),
            imported_rows = COALESCE($11, imported_rows),
            updated_rows = COALESCE($12, updated_rows),
            skipped_rows = COALESCE($13, skipped_rows),
            file_duplicates = COALESCE($14, file_duplicates),
            db_duplicates = COALESCE($15, db_duplicates),
            cursor_position = COALESCE($16, cursor_position),
            cursor_total_estimate = COALESCE($17, cursor_total_estimate),
            cursor_last_row_number = COALESCE($18, cursor_last_row_number),
            error_message = CASE WHEN $19 THEN $20 ELSE error_message END,
            error_detail = CASE WHEN $19 THEN $21 ELSE error_detail END,
            ui_state = COALESCE($22, ui_state),
            started_at = COALESCE(started_at, $23),
            completed_at = COALESCE($24, completed_at),
            updated_at = NOW()
        WHERE id = $1 AND status::text = ANY($2)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let counters = change.counters;
    let cursor = change.cursor;
    let error = change.error.as_ref();

    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(job_id)
        .bind(status_names(expected))
        .bind(change.status)
        .bind(change.last_phase)
        .bind(change.mapping.as_ref().map(Json))
        .bind(change.assignment.as_ref().map(Json))
        .bind(change.duplicates.as_ref().map(Json))
        .bind(counters.map(|c| c.total))
        .bind(counters.map(|c| c.valid))
        .bind(counters.map(|c| c.invalid))
        .bind(counters.map(|c| c.imported))
        .bind(counters.map(|c| c.updated))
        .bind(counters.map(|c| c.skipped))
        .bind(counters.map(|c| c.file_duplicates))
        .bind(counters.map(|c| c.db_duplicates))
        .bind(cursor.map(|c| c.position))
        .bind(cursor.map(|c| c.total_estimate))
        .bind(cursor.map(|c| c.last_row_number))
        .bind(error.is_some())
        .bind(error.and_then(|e| e.as_ref()).map(|e| e.message.clone()))
        .bind(error.and_then(|e| e.as_ref()).map(|e| Json(e.detail.clone())))
        .bind(change.ui_state.as_ref().map(Json))
        .bind(change.started_at)
        .bind(change.completed_at)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(record.map(ImportJob::from))
}

/// Delete a job (rows cascade) when its status is one of `expected`
pub async fn delete_job(pool: &PgPool, job_id: Uuid, expected: &[ImportJobStatus]) -> Result<bool> {
    let result = sqlx::query("DELETE FROM import_jobs WHERE id = $1 AND status::text = ANY($2)")
        .bind(job_id)
        .bind(status_names(expected))
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
