use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_postgres::types::PgLsn;
use tracing::{error, info};

use crate::apply::ApplyEngine;
use crate::config::OUTPUT_PLUGIN;
use crate::consumer::{ReplicationSource, StreamConsumer};
use crate::postgres::ReplicationConnection;
use crate::target::{setup_origin, PostgresTarget, TargetStore};
use crate::{Config, Error, Result};

/// Tunables of the running pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub standby_interval: Duration,
    pub flush_interval: Duration,
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            queue_capacity: config.replication.queue_capacity,
            standby_interval: config.standby_interval(),
            flush_interval: config.flush_interval(),
        }
    }
}

pub struct Replicator {
    config: Config,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Connects both ends and replicates until `shutdown` turns true or a
    /// fatal error occurs.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Replicator starting");
        let replication = &self.config.replication;

        let target = PostgresTarget::connect(&self.config.target.url).await?;
        let origin_progress = setup_origin(target.client(), &replication.origin_name).await?;

        let mut source = ReplicationConnection::connect(&self.config.source).await?;
        let system = source.identify_system().await?;
        source
            .create_replication_slot(&replication.slot_name, OUTPUT_PLUGIN, replication.temporary_slot)
            .await?;

        let start = origin_progress.unwrap_or(system.xlogpos);
        source
            .start_replication(&replication.slot_name, start, &self.config.plugin_args())
            .await?;

        let final_position = run_pipeline(
            source,
            target,
            start,
            PipelineOptions::from(&self.config),
            shutdown,
        )
        .await?;

        info!(position = %final_position, "Replicator stopped");
        Ok(())
    }
}

/// Runs the stream consumer and the apply task against an already started
/// replication stream and returns the consumer's final position.
///
/// The apply task is spawned; the consumer runs on the calling task. When
/// the consumer stops, the queue closes and the apply task makes its final
/// flush. Only then is the last status update sent, reporting what is now
/// durable on the target, and both connections are closed.
pub async fn run_pipeline<S, T>(
    source: S,
    target: T,
    start: PgLsn,
    options: PipelineOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<PgLsn>
where
    S: ReplicationSource,
    T: TargetStore + 'static,
{
    let (tx, rx) = mpsc::channel(options.queue_capacity);
    let (progress, applied) = watch::channel(start);

    let engine = ApplyEngine::new(target, options.flush_interval).with_progress(progress);
    let apply = tokio::spawn(engine.run(rx));

    let mut consumer = StreamConsumer::new(
        source,
        tx,
        applied.clone(),
        start,
        options.standby_interval,
    );
    let consumed = consumer.run(shutdown).await;
    let mut source = consumer.into_source();

    let applied_result = apply.await;
    let flushed = *applied.borrow();
    let final_status = match (&consumed, &applied_result) {
        (Ok(position), Ok(Ok(_))) => {
            info!(position = %position, applied = %flushed, "Sending final standby status update");
            source.send_standby_status_update(*position, flushed).await
        }
        _ => Ok(()),
    };
    let close_result = source.close().await;

    let position = match (consumed, applied_result) {
        (Ok(position), Ok(Ok(mut target))) => {
            target.close().await?;
            position
        }
        // A failing apply task closes the queue, so its error explains the consumer's.
        (_, Ok(Err(e))) => {
            error!("Apply task failed: {}", e);
            return Err(e);
        }
        (_, Err(e)) => return Err(Error::Task(e)),
        (Err(e), Ok(Ok(mut target))) => {
            target.close().await?;
            return Err(e);
        }
    };

    final_status?;
    close_result?;
    Ok(position)
}
