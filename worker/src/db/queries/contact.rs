//! Contact database queries

use anyhow::{bail, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::audit::append_events;
use super::import_job::{ImportJobRecord, JOB_COLUMNS};
use crate::services::store::{CommitBatch, RowAction};
use crate::types::{Contact, ContactDraft, ImportJob, RowStatus};

const CONTACT_COLUMNS: &str = r#"
    id, user_id, assigned_to, first_name, last_name, email, phone, phone_raw,
    company, job_title, street, city, postal_code, country, notes,
    source_import_job_id, created_at, updated_at
"#;

/// Keyset page over a tenant's contacts ordered by id
pub async fn contacts_page(
    pool: &PgPool,
    user_id: Uuid,
    after: Option<Uuid>,
    limit: i64,
    exclude_job: Uuid,
) -> Result<Vec<Contact>> {
    let sql = format!(
        r#"
        SELECT {CONTACT_COLUMNS}
        FROM contacts
        WHERE user_id = $1
          AND ($2::uuid IS NULL OR id > $2)
          AND source_import_job_id IS DISTINCT FROM $4
        ORDER BY id
        LIMIT $3
        "#
    );
    let contacts = sqlx::query_as::<_, Contact>(&sql)
        .bind(user_id)
        .bind(after)
        .bind(limit)
        .bind(exclude_job)
        .fetch_all(pool)
        .await?;

    Ok(contacts)
}

/// Apply one commit batch atomically: contacts, row outcomes, audit events, job
/// counters and cursor.
///
/// Rows that already carry a contact id or left the `valid` state are left alone, so a
/// batch can never write the same row twice or audit it twice.
pub async fn checkpoint_commit(pool: &PgPool, job: &ImportJob, batch: &CommitBatch) -> Result<Option<ImportJob>> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        r#"
        UPDATE import_jobs SET
            imported_rows = $3, updated_rows = $4, skipped_rows = $5, db_duplicates = $6,
            cursor_position = $2, cursor_total_estimate = $7, cursor_last_row_number = $8,
            updated_at = NOW()
        WHERE id = $1 AND status = 'importing' AND cursor_position = $2 - 1
        RETURNING {JOB_COLUMNS}
        "#
    );
    let record = sqlx::query_as::<_, ImportJobRecord>(&sql)
        .bind(job.id)
        .bind(batch.batch_number)
        .bind(batch.counters.imported)
        .bind(batch.counters.updated)
        .bind(batch.counters.skipped)
        .bind(batch.counters.db_duplicates)
        .bind(batch.cursor.total_estimate)
        .bind(batch.cursor.last_row_number)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(record) = record else {
        tx.rollback().await?;
        return Ok(None);
    };

    let mut events = Vec::new();
    for outcome in &batch.outcomes {
        let current: Option<(RowStatus, Option<Uuid>)> = sqlx::query_as(
            r#"
            SELECT status, contact_id
            FROM import_rows
            WHERE job_id = $1 AND row_number = $2
            FOR UPDATE
            "#,
        )
        .bind(job.id)
        .bind(outcome.row_number)
        .fetch_optional(&mut *tx)
        .await?;

        match current {
            Some((status, None)) if status.can_transition(outcome.action.row_status()) => {}
            _ => continue,
        }
        events.extend(outcome.event.clone());

        match &outcome.action {
            RowAction::Create { contact_id, draft } => {
                insert_contact(&mut tx, *contact_id, job, draft).await?;
                mark_row_imported(&mut tx, job.id, outcome.row_number, *contact_id).await?;
            }
            RowAction::Update { contact_id, draft } => {
                let updated = update_contact(&mut tx, *contact_id, job.owner_id, draft).await?;
                if !updated {
                    bail!(
                        "Contact {} matched by row {} no longer exists",
                        contact_id,
                        outcome.row_number
                    );
                }
                mark_row_imported(&mut tx, job.id, outcome.row_number, *contact_id).await?;
            }
            RowAction::Skip { reason } => {
                sqlx::query(
                    r#"
                    UPDATE import_rows
                    SET status = 'skipped', error_message = $3, updated_at = NOW()
                    WHERE job_id = $1 AND row_number = $2
                    "#,
                )
                .bind(job.id)
                .bind(outcome.row_number)
                .bind(reason)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    append_events(&mut tx, &events).await?;
    tx.commit().await?;

    Ok(Some(ImportJob::from(record)))
}

async fn insert_contact(
    tx: &mut Transaction<'_, Postgres>,
    contact_id: Uuid,
    job: &ImportJob,
    draft: &ContactDraft,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO contacts (
            id, user_id, assigned_to, first_name, last_name, email, phone, phone_raw,
            company, job_title, street, city, postal_code, country, notes,
            source_import_job_id, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW(), NOW())
        "#,
    )
    .bind(contact_id)
    .bind(job.owner_id)
    .bind(draft.assigned_to)
    .bind(&draft.first_name)
    .bind(&draft.last_name)
    .bind(&draft.email)
    .bind(&draft.phone)
    .bind(&draft.phone_raw)
    .bind(&draft.company)
    .bind(&draft.job_title)
    .bind(&draft.street)
    .bind(&draft.city)
    .bind(&draft.postal_code)
    .bind(&draft.country)
    .bind(&draft.notes)
    .bind(job.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Merge a draft into an existing contact; present values win
async fn update_contact(
    tx: &mut Transaction<'_, Postgres>,
    contact_id: Uuid,
    user_id: Uuid,
    draft: &ContactDraft,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE contacts SET
            assigned_to = COALESCE($3, assigned_to),
            first_name = COALESCE($4, first_name),
            last_name = COALESCE($5, last_name),
            email = COALESCE($6, email),
            phone = COALESCE($7, phone),
            phone_raw = COALESCE($8, phone_raw),
            company = COALESCE($9, company),
            job_title = COALESCE($10, job_title),
            street = COALESCE($11, street),
            city = COALESCE($12, city),
            postal_code = COALESCE($13, postal_code),
            country = COALESCE($14, country),
            notes = COALESCE($15, notes),
            updated_at = NOW()
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(contact_id)
    .bind(user_id)
    .bind(draft.assigned_to)
    .bind(&draft.first_name)
    .bind(&draft.last_name)
    .bind(&draft.email)
    .bind(&draft.phone)
    .bind(&draft.phone_raw)
    .bind(&draft.company)
    .bind(&draft.job_title)
    .bind(&draft.street)
    .bind(&draft.city)
    .bind(&draft.postal_code)
    .bind(&draft.country)
    .bind(&draft.notes)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn mark_row_imported(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    row_number: i64,
    contact_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_rows
        SET status = 'imported', contact_id = $3, error_message = NULL, updated_at = NOW()
        WHERE job_id = $1 AND row_number = $2 AND contact_id IS NULL
        "#,
    )
    .bind(job_id)
    .bind(row_number)
    .bind(contact_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
