//! SQLite-backed change source
//!
//! Reads the claim table written by the claims system. Expected columns:
//! `entity_id`, `claimed_by`, `claimed_at`, `updated_at`, `source`, `deleted`.
//! Timestamps may be stored as RFC 3339 or SQLite `YYYY-MM-DD HH:MM:SS` text;
//! comparisons go through `julianday()` so both forms order correctly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientsync_common::time::parse_timestamp;
use clientsync_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::poller::{ChangeSource, ClaimRow};

/// Change source polling one claim table
#[derive(Clone)]
pub struct SqliteChangeSource {
    pool: SqlitePool,
    query: String,
}

impl SqliteChangeSource {
    /// `table` must be a plain identifier; it is interpolated into the query
    pub fn new(pool: SqlitePool, table: &str) -> Result<Self> {
        let valid = !table.is_empty()
            && !table.starts_with(|c: char| c.is_ascii_digit())
            && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::Config(format!("Invalid claim table name: {:?}", table)));
        }

        let query = format!(
            r#"
            SELECT CAST(entity_id AS TEXT) AS entity_id,
                   claimed_by,
                   claimed_at,
                   updated_at,
                   source,
                   COALESCE(deleted, 0) AS deleted
            FROM {}
            WHERE julianday(updated_at) >= julianday(?)
            ORDER BY julianday(updated_at) ASC
            "#,
            table
        );

        Ok(Self { pool, query })
    }
}

#[async_trait]
impl ChangeSource for SqliteChangeSource {
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<ClaimRow>> {
        let rows = sqlx::query(&self.query)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;

        let mut claims = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_id: Option<String> = row.try_get("entity_id")?;
            let Some(entity_id) = entity_id.filter(|id| !id.trim().is_empty()) else {
                continue;
            };
            let updated_raw: Option<String> = row.try_get("updated_at")?;
            let Some(updated_at) = updated_raw.as_deref().and_then(parse_timestamp) else {
                warn!(entity_id = %entity_id, "Skipping claim row with unreadable updated_at");
                continue;
            };
            let claimed_at_raw: Option<String> = row.try_get("claimed_at")?;
            let claimed_by: Option<String> = row.try_get("claimed_by")?;
            let deleted: i64 = row.try_get("deleted")?;

            claims.push(ClaimRow {
                entity_id: entity_id.trim().to_string(),
                claimed_by: claimed_by.filter(|owner| !owner.trim().is_empty()),
                claimed_at: claimed_at_raw.as_deref().and_then(parse_timestamp),
                updated_at,
                source: row.try_get("source")?,
                deleted: deleted != 0,
            });
        }

        Ok(claims)
    }
}
