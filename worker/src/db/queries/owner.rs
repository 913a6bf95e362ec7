//! Owner directory queries

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::Owner;

/// Tenant user plus the accounts it owns
pub async fn list_owners(pool: &PgPool, tenant_id: Uuid) -> Result<Vec<Owner>> {
    let owners = sqlx::query_as::<_, Owner>(
        r#"
        SELECT id, name AS display_name, role
        FROM users
        WHERE id = $1 OR owner_id = $1
        ORDER BY name
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;

    Ok(owners)
}
