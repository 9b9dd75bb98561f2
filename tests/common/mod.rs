#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use pg_apply::apply::WriteOperation;
use pg_apply::config::{Config, ReplicationConfig, SourceConfig, TargetConfig};
use pg_apply::consumer::{ReplicationSource, SlotInfo, SystemInfo};
use pg_apply::postgres::{PrimaryKeepAlive, ReplicationMessage, XLogData};
use pg_apply::target::TargetStore;
use pg_apply::{Error, Result};
use std::collections::VecDeque;
use std::env;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let source = SourceConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
        application_name: "pg_apply_test".to_string(),
    };

    let target = TargetConfig {
        url: env::var("TEST_TARGET_URL").unwrap_or_else(|_| {
            "host=localhost port=5433 user=postgres password=postgres dbname=postgres".to_string()
        }),
    };

    let replication = ReplicationConfig {
        slot_name: format!("test_slot_{}", std::process::id()),
        publication: format!("test_publication_{}", std::process::id()),
        origin_name: format!("test_origin_{}", std::process::id()),
        temporary_slot: true,
        proto_version: 2,
        streaming: true,
        messages: true,
        standby_interval_secs: 10,
        flush_interval_ms: 200, // Short deferral for tests
        queue_capacity: 1024,
    };

    Config {
        source,
        target,
        replication,
    }
}

/// Raw pgoutput messages, as carried inside XLogData.
pub mod pgoutput {
    use super::*;

    pub fn relation(relation_id: u32, name: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(relation_id);
        put_cstr(&mut buf, "public");
        put_cstr(&mut buf, name);
        buf.put_u8(b'd');
        buf.put_u16(columns.len() as u16);
        for (column, type_id, is_key) in columns {
            buf.put_u8(u8::from(*is_key));
            put_cstr(&mut buf, column);
            buf.put_u32(*type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub fn begin(final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(0);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(0);
        buf.freeze()
    }

    /// Insert with every value in text form; `None` is NULL.
    pub fn insert(relation_id: u32, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(text) => {
                    buf.put_u8(b't');
                    buf.put_u32(text.len() as u32);
                    buf.put_slice(text.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
        buf.freeze()
    }

    fn put_cstr(buf: &mut BytesMut, value: &str) {
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }
}

pub fn xlog(wal_start: u64, data: Bytes) -> ReplicationMessage {
    ReplicationMessage::XLogData(XLogData {
        wal_start: PgLsn::from(wal_start),
        wal_end: PgLsn::from(wal_start),
        server_time: Utc::now(),
        data,
    })
}

pub fn keepalive(wal_end: u64, reply_requested: bool) -> ReplicationMessage {
    ReplicationMessage::PrimaryKeepAlive(PrimaryKeepAlive {
        wal_end: PgLsn::from(wal_end),
        server_time: Utc::now(),
        reply_requested,
    })
}

/// A source that replays a fixed list of messages and then stays idle.
pub struct MemorySource {
    messages: VecDeque<ReplicationMessage>,
    /// Every status update sent, as (written, flushed).
    pub statuses: Arc<Mutex<Vec<(PgLsn, PgLsn)>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl MemorySource {
    pub fn new(messages: Vec<ReplicationMessage>) -> Self {
        Self {
            messages: messages.into(),
            statuses: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
        }
    }
}

#[async_trait]
impl ReplicationSource for MemorySource {
    async fn identify_system(&mut self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            system_id: "7300000000000000000".to_string(),
            timeline: 1,
            xlogpos: PgLsn::from(0),
            dbname: Some("postgres".to_string()),
        })
    }

    async fn create_replication_slot(
        &mut self,
        slot_name: &str,
        _output_plugin: &str,
        _temporary: bool,
    ) -> Result<SlotInfo> {
        Ok(SlotInfo {
            slot_name: slot_name.to_string(),
            consistent_point: None,
        })
    }

    async fn start_replication(&mut self, _: &str, _: PgLsn, _: &[String]) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self, deadline: Instant) -> Result<Option<ReplicationMessage>> {
        match self.messages.pop_front() {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    async fn send_standby_status_update(&mut self, written: PgLsn, flushed: PgLsn) -> Result<()> {
        self.statuses.lock().unwrap().push((written, flushed));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// A target that records every group it executes.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    groups: Arc<Mutex<Vec<Vec<WriteOperation>>>>,
    fail: bool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn groups(&self) -> Vec<Vec<WriteOperation>> {
        self.groups.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn execute_group(&mut self, group: &[WriteOperation]) -> Result<()> {
        if self.fail {
            return Err(Error::Replication {
                message: "target rejected the batch".to_string(),
            });
        }
        self.groups.lock().unwrap().push(group.to_vec());
        Ok(())
    }
}
