//! The network side of the pipeline.
//!
//! [`StreamConsumer`] owns the replication connection and the tracked
//! position. It answers keepalives, sends periodic standby status updates and
//! hands every change buffer to the apply task through a bounded queue. It
//! never decodes change buffers itself.
//!
//! Status updates report the received position as written, but only the
//! position the apply task has made durable on the target as flushed, so the
//! server never releases WAL that still has to be applied.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, trace};

use crate::postgres::protocol::ReplicationMessage;
use crate::{Error, Result};

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: PgLsn,
    pub dbname: Option<String>,
}

/// Result of `CREATE_REPLICATION_SLOT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_name: String,
    /// `None` when the slot already existed.
    pub consistent_point: Option<PgLsn>,
}

/// A server that streams logical replication messages.
#[async_trait]
pub trait ReplicationSource: Send {
    async fn identify_system(&mut self) -> Result<SystemInfo>;

    async fn create_replication_slot(
        &mut self,
        slot_name: &str,
        output_plugin: &str,
        temporary: bool,
    ) -> Result<SlotInfo>;

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start: PgLsn,
        plugin_args: &[String],
    ) -> Result<()>;

    /// Waits for the next message until `deadline`. `Ok(None)` means the
    /// deadline passed first.
    async fn recv(&mut self, deadline: Instant) -> Result<Option<ReplicationMessage>>;

    /// Reports `written` as received and `flushed` as durably applied.
    async fn send_standby_status_update(&mut self, written: PgLsn, flushed: PgLsn) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct StreamConsumer<S> {
    source: S,
    tx: mpsc::Sender<Bytes>,
    position: PgLsn,
    applied: watch::Receiver<PgLsn>,
    standby_interval: Duration,
    next_status: Instant,
}

impl<S: ReplicationSource> StreamConsumer<S> {
    pub fn new(
        source: S,
        tx: mpsc::Sender<Bytes>,
        applied: watch::Receiver<PgLsn>,
        start: PgLsn,
        standby_interval: Duration,
    ) -> Self {
        Self {
            source,
            tx,
            position: start,
            applied,
            standby_interval,
            next_status: Instant::now() + standby_interval,
        }
    }

    /// The highest position observed so far.
    pub fn position(&self) -> PgLsn {
        self.position
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Runs until `shutdown` turns true or a fatal error occurs. Returns the
    /// final tracked position.
    ///
    /// Dropping the consumer closes the queue, which lets the apply task
    /// drain and finish. The last status update is left to the caller, once
    /// the final flush is done.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<PgLsn> {
        info!(position = %self.position, "Stream consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= self.next_status {
                self.send_status().await?;
            }

            let deadline = self.next_status;
            let message = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = self.tx.closed() => return Err(Error::QueueClosed),
                received = self.source.recv(deadline) => received?,
            };

            match message {
                None => continue,
                Some(ReplicationMessage::PrimaryKeepAlive(keepalive)) => {
                    trace!(
                        wal_end = %keepalive.wal_end,
                        reply_requested = keepalive.reply_requested,
                        "Primary keepalive"
                    );
                    self.advance(keepalive.wal_end);
                    if keepalive.reply_requested {
                        self.next_status = Instant::now();
                    }
                }
                Some(ReplicationMessage::XLogData(xlog)) => {
                    trace!(wal_start = %xlog.wal_start, len = xlog.data.len(), "XLogData");
                    self.tx
                        .send(xlog.data)
                        .await
                        .map_err(|_| Error::QueueClosed)?;
                    self.advance(xlog.wal_start);
                }
            }
        }

        info!(position = %self.position, "Shutdown requested, stopping stream consumer");
        Ok(self.position)
    }

    fn advance(&mut self, observed: PgLsn) {
        if observed > self.position {
            self.position = observed;
        }
    }

    async fn send_status(&mut self) -> Result<()> {
        let applied = *self.applied.borrow();
        self.source
            .send_standby_status_update(self.position, applied)
            .await?;
        debug!(position = %self.position, %applied, "Sent standby status update");
        self.next_status = Instant::now() + self.standby_interval;
        Ok(())
    }
}

/// Resolves once the flag is set. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
