//! The apply task: decodes change buffers from the queue and turns them into
//! grouped writes against the target store.
//!
//! [`ApplyEngine`] owns the relation cache, the type registry and the
//! [`ApplySession`]. Nothing else reads or writes them; the only inputs are
//! the queue and the session's own flush deadline.

pub mod batch;
pub mod statement;

#[cfg(test)]
pub(crate) mod test_utils;

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_postgres::types::PgLsn;
use tracing::{debug, info, warn};

use crate::postgres::decoder::decode;
use crate::postgres::relation::RelationCache;
use crate::postgres::types::{ChangeEvent, RelationSchema, Xid};
use crate::postgres::values::TypeRegistry;
use crate::target::TargetStore;
use crate::{Error, Result};

pub use batch::{ApplySession, CommitMarker, PendingBatch, SessionState};
pub use statement::{OperationKind, WriteOperation};

pub struct ApplyEngine<T> {
    relations: RelationCache,
    registry: TypeRegistry,
    session: ApplySession<T>,
    in_stream: bool,
    stream_xid: Option<Xid>,
    /// Operations of streamed transactions, keyed by top-level xid and
    /// tagged with the subtransaction that produced them.
    streams: HashMap<Xid, Vec<(Xid, WriteOperation)>>,
}

impl<T: TargetStore> ApplyEngine<T> {
    pub fn new(store: T, flush_threshold: Duration) -> Self {
        Self {
            relations: RelationCache::new(),
            registry: TypeRegistry::new(),
            session: ApplySession::new(store, flush_threshold),
            in_stream: false,
            stream_xid: None,
            streams: HashMap::new(),
        }
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Reports the commit position of every applied batch on `progress`.
    pub fn with_progress(mut self, progress: watch::Sender<PgLsn>) -> Self {
        self.session.set_progress(progress);
        self
    }

    pub fn session(&self) -> &ApplySession<T> {
        &self.session
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn in_stream(&self) -> bool {
        self.in_stream
    }

    /// Processes buffers until the queue closes, then flushes whatever is
    /// pending and hands the store back.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Bytes>) -> Result<T> {
        info!("Apply task started");

        loop {
            let deadline = self.session.flush_deadline();
            tokio::select! {
                biased;
                _ = wait_for(deadline) => self.session.on_timer().await?,
                buffer = rx.recv() => match buffer {
                    Some(buffer) => self.handle_buffer(&buffer).await?,
                    None => break,
                },
            }
        }

        if self.session.state() == SessionState::InTransaction {
            warn!("Change queue closed inside a transaction, its changes are discarded");
        }
        info!("Change queue closed, flushing pending batch");
        self.session.flush().await?;
        Ok(self.session.into_store())
    }

    pub async fn handle_buffer(&mut self, buffer: &Bytes) -> Result<()> {
        let event = decode(buffer, self.in_stream)?;
        self.handle_event(event).await
    }

    pub async fn handle_event(&mut self, event: ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Relation(schema) => {
                self.relations.put(schema);
            }
            ChangeEvent::Type(body) => self.registry.register_type(&body),
            ChangeEvent::Origin(origin) => {
                debug!(origin = %origin.name, commit_lsn = %origin.commit_lsn, "ORIGIN");
            }
            ChangeEvent::Begin(begin) => {
                debug!(xid = begin.xid, final_lsn = %begin.final_lsn, "BEGIN");
                self.session.begin()?;
            }
            ChangeEvent::Commit(commit) => {
                debug!(commit_lsn = %commit.commit_lsn, end_lsn = %commit.end_lsn, "COMMIT");
                self.session.commit(commit.end_lsn, commit.timestamp).await?;
            }
            ChangeEvent::Insert(insert) => {
                let schema = self.relations.get(insert.relation_id)?;
                let operation = WriteOperation::insert(schema, &self.registry, &insert.tuple)?;
                self.record(insert.xid, operation)?;
            }
            ChangeEvent::Update(update) => {
                let schema = self.relations.get(update.relation_id)?;
                let operation = WriteOperation::update(
                    schema,
                    &self.registry,
                    update.old.as_ref(),
                    &update.new,
                )?;
                match operation {
                    Some(operation) => self.record(update.xid, operation)?,
                    None => debug!(
                        relation_id = update.relation_id,
                        "UPDATE with no changed columns skipped"
                    ),
                }
            }
            ChangeEvent::Delete(delete) => {
                let schema = self.relations.get(delete.relation_id)?;
                let operation = WriteOperation::delete(schema, &self.registry, &delete.old)?;
                self.record(delete.xid, operation)?;
            }
            ChangeEvent::Truncate(truncate) => {
                if truncate.relation_ids.is_empty() {
                    return Ok(());
                }
                let schemas = truncate
                    .relation_ids
                    .iter()
                    .map(|id| self.relations.get(*id))
                    .collect::<Result<Vec<&RelationSchema>>>()?;
                let operation = WriteOperation::truncate(
                    &schemas,
                    truncate.cascade,
                    truncate.restart_identity,
                );
                self.record(truncate.xid, operation)?;
            }
            ChangeEvent::Message(message) => {
                info!(
                    transactional = message.transactional,
                    lsn = %message.lsn,
                    "Logical decoding message: {:?}, {} bytes",
                    message.prefix,
                    message.content.len()
                );
            }
            ChangeEvent::StreamStart(start) => {
                debug!(xid = start.xid, first_segment = start.first_segment, "STREAM START");
                self.in_stream = true;
                self.stream_xid = Some(start.xid);
                self.streams.entry(start.xid).or_default();
            }
            ChangeEvent::StreamStop => {
                debug!("STREAM STOP");
                self.in_stream = false;
                self.stream_xid = None;
            }
            ChangeEvent::StreamCommit(commit) => {
                let operations: Vec<WriteOperation> = self
                    .streams
                    .remove(&commit.xid)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(_, operation)| operation)
                    .collect();
                debug!(
                    xid = commit.xid,
                    operations = operations.len(),
                    "STREAM COMMIT"
                );
                self.session
                    .commit_streamed(operations, commit.end_lsn, commit.timestamp)
                    .await?;
            }
            ChangeEvent::StreamAbort(abort) => {
                if abort.sub_xid == abort.xid {
                    self.streams.remove(&abort.xid);
                } else if let Some(operations) = self.streams.get_mut(&abort.xid) {
                    operations.retain(|(xid, _)| *xid != abort.sub_xid);
                }
                debug!(xid = abort.xid, sub_xid = abort.sub_xid, "STREAM ABORT");
            }
            ChangeEvent::Unknown(tag) => {
                debug!("Unknown message type in pgoutput stream: {:?}", tag as char);
            }
        }
        Ok(())
    }

    fn record(&mut self, xid: Option<Xid>, operation: WriteOperation) -> Result<()> {
        if !self.in_stream {
            return self.session.record(operation);
        }
        let top = self
            .stream_xid
            .ok_or_else(|| Error::Protocol("Streamed change without STREAM START".to_string()))?;
        self.streams
            .entry(top)
            .or_default()
            .push((xid.unwrap_or(top), operation));
        Ok(())
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
