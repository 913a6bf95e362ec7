//! Audit event queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::types::AuditEvent;

/// Append events inside the caller's transaction; re-appending the same
/// (entity, job, type) is a no-op
pub async fn append_events(tx: &mut Transaction<'_, Postgres>, events: &[AuditEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }

    let ids: Vec<Uuid> = events.iter().map(|_| Uuid::new_v4()).collect();
    let entity_ids: Vec<Uuid> = events.iter().map(|e| e.entity_id).collect();
    let job_ids: Vec<Uuid> = events.iter().map(|e| e.job_id).collect();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    let actors: Vec<Uuid> = events.iter().map(|e| e.actor_id).collect();
    let timestamps: Vec<DateTime<Utc>> = events.iter().map(|e| e.timestamp).collect();

    sqlx::query(
        r#"
        INSERT INTO audit_events (id, entity_id, job_id, event_type, actor_id, created_at)
        SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::uuid[], $6::timestamptz[])
        ON CONFLICT (entity_id, job_id, event_type) DO NOTHING
        "#,
    )
    .bind(&ids)
    .bind(&entity_ids)
    .bind(&job_ids)
    .bind(&types)
    .bind(&actors)
    .bind(&timestamps)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
