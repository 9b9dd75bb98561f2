//! Framing of the messages exchanged inside the replication CopyBoth stream.
//!
//! The server sends `XLogData` (`w`) and primary keepalive (`k`) payloads,
//! the client answers with standby status updates (`r`). Timestamps are
//! microseconds since 2000-01-01 00:00:00 UTC.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio_postgres::types::PgLsn;

use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch.
pub const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

const XLOG_DATA_TAG: u8 = b'w';
const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 24;
const PRIMARY_KEEPALIVE_LEN: usize = 17;

pub fn pg_timestamp_to_datetime(micros: i64) -> Result<DateTime<Utc>> {
    let unix_micros = micros
        .checked_add(PG_EPOCH_UNIX_MICROS)
        .ok_or_else(|| Error::Protocol(format!("timestamp out of range: {}", micros)))?;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = (unix_micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Protocol(format!("timestamp out of range: {}", micros)))
}

pub fn datetime_to_pg_timestamp(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_micros() - PG_EPOCH_UNIX_MICROS
}

#[derive(Debug, Clone, PartialEq)]
pub struct XLogData {
    pub wal_start: PgLsn,
    pub wal_end: PgLsn,
    pub server_time: DateTime<Utc>,
    /// The raw pgoutput message.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeepAlive {
    pub wal_end: PgLsn,
    pub server_time: DateTime<Utc>,
    pub reply_requested: bool,
}

/// A CopyData payload received from the server during replication.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    XLogData(XLogData),
    PrimaryKeepAlive(PrimaryKeepAlive),
}

impl ReplicationMessage {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Protocol("Empty copy-data message".to_string()));
        }

        let tag = data[0];
        let mut cursor = &data[1..];

        match tag {
            XLOG_DATA_TAG => {
                if cursor.remaining() < XLOG_DATA_HEADER_LEN {
                    return Err(Error::Protocol("Invalid XLogData header size".to_string()));
                }
                let wal_start = PgLsn::from(cursor.get_u64());
                let wal_end = PgLsn::from(cursor.get_u64());
                let server_time = pg_timestamp_to_datetime(cursor.get_i64())?;

                Ok(ReplicationMessage::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data: data.slice(1 + XLOG_DATA_HEADER_LEN..),
                }))
            }
            PRIMARY_KEEPALIVE_TAG => {
                if cursor.remaining() < PRIMARY_KEEPALIVE_LEN {
                    return Err(Error::Protocol("Invalid keepalive message size".to_string()));
                }
                let wal_end = PgLsn::from(cursor.get_u64());
                let server_time = pg_timestamp_to_datetime(cursor.get_i64())?;
                let reply_requested = cursor.get_u8() != 0;

                Ok(ReplicationMessage::PrimaryKeepAlive(PrimaryKeepAlive {
                    wal_end,
                    server_time,
                    reply_requested,
                }))
            }
            _ => Err(Error::Protocol(format!("Unknown copy-data tag: {}", tag))),
        }
    }
}

/// Encodes a standby status update. `written` is the last position received;
/// `flushed` is reported as both flushed and applied, and is what the server
/// may discard WAL up to.
pub fn encode_standby_status_update(
    written: PgLsn,
    flushed: PgLsn,
    now: DateTime<Utc>,
    reply_requested: bool,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
    buf.put_u64(u64::from(written));
    buf.put_u64(u64::from(flushed));
    buf.put_u64(u64::from(flushed));
    buf.put_i64(datetime_to_pg_timestamp(now));
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
