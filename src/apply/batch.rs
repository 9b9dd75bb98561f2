//! Grouping of committed transactions into flushes.
//!
//! Operations of the open transaction are held apart from the pending batch
//! and only join it when the commit arrives, so a flush can never expose a
//! partial transaction. After a commit the batch is flushed at once if the
//! previous flush (or the session start) is older than the threshold,
//! otherwise a deferred flush is armed for one threshold from now. Beginning
//! a transaction disarms it.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use super::statement::WriteOperation;
use crate::target::TargetStore;
use crate::{Error, Result};

/// Position and time of the last transaction folded into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMarker {
    pub lsn: PgLsn,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PendingBatch {
    operations: Vec<WriteOperation>,
    commit: Option<CommitMarker>,
    transactions: usize,
}

impl PendingBatch {
    pub fn operations(&self) -> &[WriteOperation] {
        &self.operations
    }

    pub fn commit(&self) -> Option<CommitMarker> {
        self.commit
    }

    /// Number of committed transactions folded in since the last flush.
    pub fn transactions(&self) -> usize {
        self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn fold(&mut self, operations: Vec<WriteOperation>, marker: CommitMarker) {
        self.operations.extend(operations);
        self.commit = Some(marker);
        self.transactions += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    InTransaction,
}

/// Owns the target store and everything needed to decide when to write.
pub struct ApplySession<T> {
    store: T,
    batch: PendingBatch,
    current: Vec<WriteOperation>,
    state: SessionState,
    threshold: Duration,
    last_flush: Instant,
    flush_deadline: Option<Instant>,
    /// Receives the commit position of every applied batch.
    progress: Option<watch::Sender<PgLsn>>,
}

impl<T: TargetStore> ApplySession<T> {
    pub fn new(store: T, threshold: Duration) -> Self {
        Self {
            store,
            batch: PendingBatch::default(),
            current: Vec::new(),
            state: SessionState::Idle,
            threshold,
            last_flush: Instant::now(),
            flush_deadline: None,
            progress: None,
        }
    }

    /// Publishes the commit position of each applied batch on `progress`.
    pub fn set_progress(&mut self, progress: watch::Sender<PgLsn>) {
        self.progress = Some(progress);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn batch(&self) -> &PendingBatch {
        &self.batch
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    pub fn into_store(self) -> T {
        self.store
    }

    /// When the deferred flush is due, if one is armed.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state == SessionState::InTransaction {
            return Err(Error::Protocol(
                "BEGIN received inside an open transaction".to_string(),
            ));
        }
        self.flush_deadline = None;
        self.state = SessionState::InTransaction;
        Ok(())
    }

    /// Adds an operation to the open transaction.
    pub fn record(&mut self, operation: WriteOperation) -> Result<()> {
        if self.state != SessionState::InTransaction {
            return Err(Error::Protocol(format!(
                "{:?} received outside a transaction",
                operation.kind
            )));
        }
        self.current.push(operation);
        Ok(())
    }

    pub async fn commit(&mut self, lsn: PgLsn, timestamp: DateTime<Utc>) -> Result<()> {
        if self.state != SessionState::InTransaction {
            return Err(Error::Protocol(
                "COMMIT received outside a transaction".to_string(),
            ));
        }
        self.state = SessionState::Idle;
        let operations = std::mem::take(&mut self.current);
        self.batch.fold(operations, CommitMarker { lsn, timestamp });
        self.apply_flush_policy().await
    }

    /// Folds in a streamed transaction whose operations were buffered
    /// outside the session.
    pub async fn commit_streamed(
        &mut self,
        operations: Vec<WriteOperation>,
        lsn: PgLsn,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Protocol(
                "STREAM COMMIT received inside an open transaction".to_string(),
            ));
        }
        self.batch.fold(operations, CommitMarker { lsn, timestamp });
        self.apply_flush_policy().await
    }

    async fn apply_flush_policy(&mut self) -> Result<()> {
        if self.last_flush.elapsed() > self.threshold {
            return self.flush().await;
        }
        debug!(
            operations = self.batch.operations.len(),
            "Deferring flush by {:?}", self.threshold
        );
        self.flush_deadline = Some(Instant::now() + self.threshold);
        Ok(())
    }

    /// Called when the deferred flush is due.
    pub async fn on_timer(&mut self) -> Result<()> {
        self.flush_deadline = None;
        self.flush().await
    }

    /// Writes the pending batch followed by the origin advance as one group.
    /// An empty batch is left untouched.
    pub async fn flush(&mut self) -> Result<()> {
        self.flush_deadline = None;
        let marker = match self.batch.commit {
            Some(marker) if !self.batch.is_empty() => marker,
            _ => return Ok(()),
        };
        if !self.current.is_empty() {
            debug!(
                operations = self.current.len(),
                "Open transaction excluded from flush"
            );
        }

        let transactions = self.batch.transactions;
        let mut group = std::mem::take(&mut self.batch.operations);
        group.push(WriteOperation::origin_advance(marker.lsn, marker.timestamp));

        let started = Instant::now();
        if let Err(e) = self.store.execute_group(&group).await {
            warn!(commit_lsn = %marker.lsn, "Failed to apply batch: {}", e);
            return Err(Error::Flush {
                commit_lsn: marker.lsn,
                source: Box::new(e),
            });
        }

        info!(
            commit_lsn = %marker.lsn,
            transactions,
            operations = group.len(),
            "Applied batch in {:?}",
            started.elapsed()
        );
        self.batch = PendingBatch::default();
        self.last_flush = Instant::now();
        if let Some(progress) = &self.progress {
            progress.send_replace(marker.lsn);
        }
        Ok(())
    }
}
