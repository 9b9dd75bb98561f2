use tokio_postgres::types::PgLsn;
use tokio_postgres::Client;
use tracing::info;

use crate::Result;

/// Creates the replication origin `name` if missing and binds it to the
/// session of `client`.
///
/// Returns the last position recorded against the origin, or `None` when
/// nothing has been applied under it yet.
pub async fn setup_origin(client: &Client, name: &str) -> Result<Option<PgLsn>> {
    let existing = client
        .query_opt(
            "SELECT roident FROM pg_replication_origin WHERE roname = $1",
            &[&name],
        )
        .await?;

    if existing.is_none() {
        client
            .execute("SELECT pg_replication_origin_create($1)", &[&name])
            .await?;
        info!("Created replication origin '{}'", name);
    }

    client
        .execute("SELECT pg_replication_origin_session_setup($1)", &[&name])
        .await?;

    let row = client
        .query_one("SELECT pg_replication_origin_session_progress(false)", &[])
        .await?;
    let progress: Option<PgLsn> = row.try_get(0)?;
    let progress = progress.filter(|lsn| u64::from(*lsn) != 0);

    match progress {
        Some(lsn) => info!("Replication origin '{}' at {}", name, lsn),
        None => info!("Replication origin '{}' has no recorded progress", name),
    }
    Ok(progress)
}
