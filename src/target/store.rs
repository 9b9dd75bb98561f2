use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::apply::statement::WriteOperation;
use crate::Result;

/// Destination of grouped write operations.
#[async_trait]
pub trait TargetStore: Send {
    /// Applies `group` as one unit. Either every operation takes effect or
    /// none does.
    async fn execute_group(&mut self, group: &[WriteOperation]) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A regular PostgreSQL session on the target database.
pub struct PostgresTarget {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PostgresTarget {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to target database");

        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Target connection error: {}", e);
            }
        });

        info!("Successfully connected to target database");

        Ok(Self {
            client,
            connection_task,
        })
    }

    /// The underlying session. Replication origin setup must run here so it
    /// applies to the transactions issued by [`TargetStore::execute_group`].
    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl TargetStore for PostgresTarget {
    async fn execute_group(&mut self, group: &[WriteOperation]) -> Result<()> {
        let transaction = self.client.transaction().await?;

        for operation in group {
            let params: Vec<&(dyn ToSql + Sync)> = operation
                .params
                .iter()
                .map(|p| p as &(dyn ToSql + Sync))
                .collect();
            let rows = transaction.execute(operation.sql.as_str(), &params).await?;
            debug!(kind = ?operation.kind, rows, "{}", operation.sql);
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        info!("Closing target connection");
        self.connection_task.abort();
        Ok(())
    }
}
