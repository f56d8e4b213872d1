//! Database access layer
//!
//! The claim store is owned by another system; this service only reads it.

use std::str::FromStr;

use clientsync_common::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

mod changes;
pub use changes::SqliteChangeSource;

/// Open a read-only pool on the claim store at `database_url`
pub async fn connect_readonly(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    tracing::debug!(database_url, "Connected to claim store (read-only)");
    Ok(pool)
}
