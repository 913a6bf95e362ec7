//! Import row database queries

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::import_job::{ImportJobRecord, JOB_COLUMNS};
use crate::services::store::ParseCheckpoint;
use crate::types::{
    DuplicateKind, FieldErrors, ImportJob, ImportRow, NormalizedRecord, Page, RawRecord, RowFilter,
    RowStatus,
};

const ROW_COLUMNS: &str = r#"
    job_id, row_number, chunk_number, status, raw, normalized, errors,
    duplicate, dedupe_key, matched_contact_id, contact_id, error_message,
    created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct ImportRowRecord {
    job_id: Uuid,
    row_number: i64,
    chunk_number: i64,
    status: RowStatus,
    raw: Json<RawRecord>,
    normalized: Json<NormalizedRecord>,
    errors: Json<FieldErrors>,
    duplicate: DuplicateKind,
    dedupe_key: Option<String>,
    matched_contact_id: Option<Uuid>,
    contact_id: Option<Uuid>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ImportRowRecord> for ImportRow {
    fn from(r: ImportRowRecord) -> Self {
        ImportRow {
            job_id: r.job_id,
            row_number: r.row_number,
            chunk_number: r.chunk_number,
            status: r.status,
            raw: r.raw.0,
            normalized: r.normalized.0,
            errors: r.errors.0,
            duplicate: r.duplicate,
            dedupe_key: r.dedupe_key,
            matched_contact_id: r.matched_contact_id,
            contact_id: r.contact_id,
            error_message: r.error_message,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Persist one parse chunk and advance the job cursor/counters atomically.
///
/// The job update runs first and is conditional on `status = 'parsing'` and the cursor
/// sitting right before this chunk; when it matches nothing the transaction is rolled
/// back. Rows are upserted on (job_id, row_number).
pub async fn checkpoint_parse(
    pool: &PgPool,
    job_id: Uuid,
    checkpoint: &ParseCheckpoint,
) -> Result<Option<ImportJob>> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        r#"
        UPDATE import_jobs SET
            total_rows = $3, valid_rows = $4, invalid_rows = $5,
            file_duplicates = $6,
            cursor_position = $2, cursor_total_estimate = $7, cursor_last_row_number = $8,
            updated_at = NOW()
        WHERE id = $1 AND status = 'parsing' AND cursor_position = $2 - 1
        RETURNING {JOB_COLUMNS}
        "#
    );
    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(job_id)
        .bind(checkpoint.chunk_number)
        .bind(checkpoint.counters.total)
        .bind(checkpoint.counters.valid)
        .bind(checkpoint.counters.invalid)
        .bind(checkpoint.counters.file_duplicates)
        .bind(checkpoint.cursor.total_estimate)
        .bind(checkpoint.cursor.last_row_number)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(record) = record else {
        tx.rollback().await?;
        return Ok(None);
    };

    let rows = &checkpoint.rows;
    let row_numbers: Vec<i64> = rows.iter().map(|r| r.row_number).collect();
    let chunk_numbers: Vec<i64> = rows.iter().map(|r| r.chunk_number).collect();
    let statuses: Vec<&str> = rows.iter().map(|r| r.status.as_str()).collect();
    let raws = rows
        .iter()
        .map(|r| serde_json::to_string(&r.raw))
        .collect::<Result<Vec<_>, _>>()?;
    let normalized = rows
        .iter()
        .map(|r| serde_json::to_string(&r.normalized))
        .collect::<Result<Vec<_>, _>>()?;
    let errors = rows
        .iter()
        .map(|r| serde_json::to_string(&r.errors))
        .collect::<Result<Vec<_>, _>>()?;
    let duplicates: Vec<&str> = rows.iter().map(|r| r.duplicate.as_str()).collect();
    let keys: Vec<Option<String>> = rows.iter().map(|r| r.dedupe_key.clone()).collect();

    sqlx::query(
        r#"
        INSERT INTO import_rows (
            job_id, row_number, chunk_number, status, raw, normalized, errors,
            duplicate, dedupe_key, created_at, updated_at
        )
        SELECT $1, u.row_number, u.chunk_number, u.status::import_row_status,
               u.raw::jsonb, u.normalized::jsonb, u.errors::jsonb,
               u.duplicate::import_duplicate_kind, u.dedupe_key, NOW(), NOW()
        FROM UNNEST($2::bigint[], $3::bigint[], $4::text[], $5::text[], $6::text[], $7::text[], $8::text[], $9::text[])
            AS u(row_number, chunk_number, status, raw, normalized, errors, duplicate, dedupe_key)
        ON CONFLICT (job_id, row_number) DO UPDATE SET
            chunk_number = EXCLUDED.chunk_number,
            status = EXCLUDED.status,
            raw = EXCLUDED.raw,
            normalized = EXCLUDED.normalized,
            errors = EXCLUDED.errors,
            duplicate = EXCLUDED.duplicate,
            dedupe_key = EXCLUDED.dedupe_key,
            matched_contact_id = NULL,
            updated_at = NOW()
        "#,
    )
    .bind(job_id)
    .bind(&row_numbers)
    .bind(&chunk_numbers)
    .bind(&statuses)
    .bind(&raws)
    .bind(&normalized)
    .bind(&errors)
    .bind(&duplicates)
    .bind(&keys)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ImportJob::from(record)))
}

/// Distinct dedupe keys of rows that passed validation
pub async fn dedupe_keys(pool: &PgPool, job_id: Uuid) -> Result<HashSet<String>> {
    let keys: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT dedupe_key
        FROM import_rows
        WHERE job_id = $1
          AND dedupe_key IS NOT NULL
          AND status IN ('valid', 'imported', 'skipped')
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(keys.into_iter().map(|(k,)| k).collect())
}

/// Re-flag store duplicates among valid rows; returns the job's store-duplicate count
pub async fn mark_db_duplicates(pool: &PgPool, job_id: Uuid, matches: &HashMap<String, Uuid>) -> Result<i64> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE import_rows
        SET duplicate = 'none', matched_contact_id = NULL, updated_at = NOW()
        WHERE job_id = $1 AND status = 'valid' AND duplicate = 'db_duplicate'
        "#,
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    if !matches.is_empty() {
        let (keys, contact_ids): (Vec<&str>, Vec<Uuid>) =
            matches.iter().map(|(k, id)| (k.as_str(), *id)).unzip();

        sqlx::query(
            r#"
            UPDATE import_rows r
            SET duplicate = 'db_duplicate', matched_contact_id = m.contact_id, updated_at = NOW()
            FROM UNNEST($2::text[], $3::uuid[]) AS m(dedupe_key, contact_id)
            WHERE r.job_id = $1
              AND r.status = 'valid'
              AND r.duplicate = 'none'
              AND r.dedupe_key = m.dedupe_key
            "#,
        )
        .bind(job_id)
        .bind(&keys)
        .bind(&contact_ids)
        .execute(&mut *tx)
        .await?;
    }

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM import_rows WHERE job_id = $1 AND duplicate = 'db_duplicate'",
    )
    .bind(job_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(count)
}

/// Next valid rows after a row number, in file order
pub async fn valid_rows_after(
    pool: &PgPool,
    job_id: Uuid,
    after_row_number: i64,
    limit: i64,
) -> Result<Vec<ImportRow>> {
    let sql = format!(
        r#"
        SELECT {ROW_COLUMNS}
        FROM import_rows
        WHERE job_id = $1 AND status = 'valid' AND row_number > $2
        ORDER BY row_number
        LIMIT $3
        "#
    );
    let rows = sqlx::query_as::<_, ImportRowRecord>(&sql)
        .bind(job_id)
        .bind(after_row_number)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(ImportRow::from).collect())
}

/// Paged rows for the review tables, with total count
pub async fn list_rows(
    pool: &PgPool,
    job_id: Uuid,
    filter: Option<RowFilter>,
    page: Page,
) -> Result<(Vec<ImportRow>, i64)> {
    let page = page.clamped();
    let (status, duplicate) = filter.map(|f| f.criteria()).unwrap_or((None, None));
    let status = status.map(|s| s.as_str());
    let duplicate = duplicate.map(|d| d.as_str());

    let where_clause = r#"
        WHERE job_id = $1
          AND ($2::text IS NULL OR status::text = $2)
          AND ($3::text IS NULL OR duplicate::text = $3)
    "#;

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM import_rows {where_clause}"))
        .bind(job_id)
        .bind(status)
        .bind(duplicate)
        .fetch_one(pool)
        .await?;

    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM import_rows {where_clause} ORDER BY row_number LIMIT $4 OFFSET $5"
    );
    let rows = sqlx::query_as::<_, ImportRowRecord>(&sql)
        .bind(job_id)
        .bind(status)
        .bind(duplicate)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(pool)
        .await?;

    Ok((rows.into_iter().map(ImportRow::from).collect(), total))
}
