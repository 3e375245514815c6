use std::time::Duration;

use anyhow::{anyhow, Context};
use sqlx::{migrate::Migrator, postgres::PgConnection, Connection};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Opens a single connection bounded by `timeout`. Callers own and close it.
pub async fn connect_once(database_url: &str, timeout: Duration) -> anyhow::Result<PgConnection> {
    let conn = tokio::time::timeout(timeout, PgConnection::connect(database_url))
        .await
        .map_err(|_| anyhow!("Timed out after {:?} connecting to the database", timeout))?
        .context("Failed to connect to the database")?;
    Ok(conn)
}

/// Applies pending schema migrations over an existing connection.
pub async fn migrate(conn: &mut PgConnection) -> anyhow::Result<()> {
    MIGRATOR
        .run_direct(conn)
        .await
        .context("Failed to apply database migrations")
}
