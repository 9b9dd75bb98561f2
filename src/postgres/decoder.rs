use bytes::{Buf, Bytes};
use tokio_postgres::types::PgLsn;
use tracing::trace;

use super::protocol::pg_timestamp_to_datetime;
use super::types::*;
use crate::{Error, Result};

/// Decodes one pgoutput message.
///
/// `in_stream` must be true between a `StreamStart` and the matching
/// `StreamStop`: while a large transaction is being streamed, row, relation,
/// type and logical messages carry a leading transaction id.
///
/// Unknown message tags decode to [`ChangeEvent::Unknown`]. Truncated or
/// structurally invalid buffers fail with [`Error::Protocol`].
pub fn decode(data: &Bytes, in_stream: bool) -> Result<ChangeEvent> {
    let mut reader = Reader::new(data);
    let tag = reader.u8("message tag")?;

    let event = match tag {
        b'B' => ChangeEvent::Begin(BeginBody {
            final_lsn: reader.lsn()?,
            timestamp: reader.timestamp()?,
            xid: reader.u32("xid")?,
        }),
        b'C' => ChangeEvent::Commit(CommitBody {
            flags: reader.u8("commit flags")?,
            commit_lsn: reader.lsn()?,
            end_lsn: reader.lsn()?,
            timestamp: reader.timestamp()?,
        }),
        b'O' => ChangeEvent::Origin(OriginBody {
            commit_lsn: reader.lsn()?,
            name: reader.cstr("origin name")?,
        }),
        b'R' => ChangeEvent::Relation(decode_relation(&mut reader, in_stream)?),
        b'Y' => ChangeEvent::Type(TypeBody {
            xid: reader.stream_xid(in_stream)?,
            type_id: reader.u32("type oid")?,
            namespace: reader.cstr("type namespace")?,
            name: reader.cstr("type name")?,
        }),
        b'I' => {
            let xid = reader.stream_xid(in_stream)?;
            let relation_id = reader.u32("relation id")?;
            match reader.u8("tuple marker")? {
                b'N' => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected tuple type in INSERT: {}",
                        other as char
                    )))
                }
            }
            ChangeEvent::Insert(InsertBody {
                xid,
                relation_id,
                tuple: decode_tuple(&mut reader)?,
            })
        }
        b'U' => {
            let xid = reader.stream_xid(in_stream)?;
            let relation_id = reader.u32("relation id")?;
            let mut old = None;
            let mut marker = reader.u8("tuple marker")?;
            match marker {
                b'K' | b'O' => {
                    let tuple = decode_tuple(&mut reader)?;
                    old = Some(if marker == b'K' {
                        OldTuple::Key(tuple)
                    } else {
                        OldTuple::Full(tuple)
                    });
                    marker = reader.u8("tuple marker")?;
                }
                _ => {}
            }
            if marker != b'N' {
                return Err(Error::Protocol(format!(
                    "Unexpected tuple type in UPDATE: {}",
                    marker as char
                )));
            }
            ChangeEvent::Update(UpdateBody {
                xid,
                relation_id,
                old,
                new: decode_tuple(&mut reader)?,
            })
        }
        b'D' => {
            let xid = reader.stream_xid(in_stream)?;
            let relation_id = reader.u32("relation id")?;
            let old = match reader.u8("tuple marker")? {
                b'K' => OldTuple::Key(decode_tuple(&mut reader)?),
                b'O' => OldTuple::Full(decode_tuple(&mut reader)?),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected tuple type in DELETE: {}",
                        other as char
                    )))
                }
            };
            ChangeEvent::Delete(DeleteBody {
                xid,
                relation_id,
                old,
            })
        }
        b'T' => {
            let xid = reader.stream_xid(in_stream)?;
            let count = reader.u32("relation count")?;
            let options = reader.u8("truncate options")?;
            let relation_ids = (0..count)
                .map(|_| reader.u32("relation id"))
                .collect::<Result<Vec<_>>>()?;
            ChangeEvent::Truncate(TruncateBody {
                xid,
                relation_ids,
                cascade: options & 1 != 0,
                restart_identity: options & 2 != 0,
            })
        }
        b'M' => {
            let xid = reader.stream_xid(in_stream)?;
            let flags = reader.u8("message flags")?;
            let lsn = reader.lsn()?;
            let prefix = reader.cstr("message prefix")?;
            let len = reader.u32("message length")? as usize;
            ChangeEvent::Message(LogicalMessageBody {
                xid,
                transactional: flags & 1 != 0,
                lsn,
                prefix,
                content: reader.bytes(len, "message content")?,
            })
        }
        b'S' => ChangeEvent::StreamStart(StreamStartBody {
            xid: reader.u32("xid")?,
            first_segment: reader.u8("first segment flag")? == 1,
        }),
        b'E' => ChangeEvent::StreamStop,
        b'c' => ChangeEvent::StreamCommit(StreamCommitBody {
            xid: reader.u32("xid")?,
            flags: reader.u8("commit flags")?,
            commit_lsn: reader.lsn()?,
            end_lsn: reader.lsn()?,
            timestamp: reader.timestamp()?,
        }),
        // Protocol version 4 appends the abort LSN and timestamp; they are not needed.
        b'A' => ChangeEvent::StreamAbort(StreamAbortBody {
            xid: reader.u32("xid")?,
            sub_xid: reader.u32("sub-transaction xid")?,
        }),
        other => ChangeEvent::Unknown(other),
    };

    trace!(kind = event.kind(), in_stream, "decoded pgoutput message");
    Ok(event)
}

fn decode_relation(reader: &mut Reader<'_>, in_stream: bool) -> Result<RelationSchema> {
    let _xid = reader.stream_xid(in_stream)?;
    let relation_id = reader.u32("relation id")?;
    let namespace = reader.cstr("relation namespace")?;
    let name = reader.cstr("relation name")?;
    let identity = reader.u8("replica identity")?;
    let replica_identity = ReplicaIdentity::from_byte(identity).ok_or_else(|| {
        Error::Protocol(format!("Unknown replica identity: {}", identity as char))
    })?;
    let column_count = reader.u16("column count")?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let flags = reader.u8("column flags")?;
        let name = reader.cstr("column name")?;
        let type_id = reader.u32("column type")?;
        let type_modifier = reader.i32("column type modifier")?;
        columns.push(ColumnSchema {
            name,
            type_id,
            type_modifier,
            is_key: flags & 1 != 0,
        });
    }

    Ok(RelationSchema {
        relation_id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_tuple(reader: &mut Reader<'_>) -> Result<TupleData> {
    let count = reader.u16("tuple column count")?;
    let mut columns = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let column = match reader.u8("column kind")? {
            b'n' => TupleColumn::Null,
            b'u' => TupleColumn::UnchangedToast,
            b't' => {
                let len = reader.u32("column length")? as usize;
                TupleColumn::Text(reader.bytes(len, "text value")?)
            }
            b'b' => {
                let len = reader.u32("column length")? as usize;
                TupleColumn::Binary(reader.bytes(len, "binary value")?)
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unknown column type: {}",
                    other as char
                )))
            }
        };
        columns.push(column);
    }

    Ok(TupleData::new(columns))
}

/// Bounds-checked big-endian reader over a shared buffer.
///
/// Values are sliced out of the original `Bytes` rather than copied.
struct Reader<'a> {
    data: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a Bytes) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&[u8]> {
        if self.data.len() - self.pos < len {
            return Err(Error::Protocol(format!(
                "Truncated message reading {}: need {} bytes, have {}",
                what,
                len,
                self.data.len() - self.pos
            )));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        Ok(self.take(2, what)?.get_u16())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(self.take(4, what)?.get_u32())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        Ok(self.take(4, what)?.get_i32())
    }

    fn lsn(&mut self) -> Result<PgLsn> {
        Ok(PgLsn::from(self.take(8, "lsn")?.get_u64()))
    }

    fn timestamp(&mut self) -> Result<chrono::DateTime<chrono::Utc>> {
        let micros = self.take(8, "timestamp")?.get_i64();
        pg_timestamp_to_datetime(micros)
    }

    fn stream_xid(&mut self, in_stream: bool) -> Result<Option<Xid>> {
        if in_stream {
            self.u32("xid").map(Some)
        } else {
            Ok(None)
        }
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<Bytes> {
        self.take(len, what)?;
        Ok(self.data.slice(self.pos - len..self.pos))
    }

    fn cstr(&mut self, what: &str) -> Result<String> {
        let nul = self
            .remaining()
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Protocol(format!("Unterminated string reading {}", what)))?;
        let raw = self.take(nul + 1, what)?;
        std::str::from_utf8(&raw[..nul])
            .map(str::to_owned)
            .map_err(|e| Error::Protocol(format!("Invalid UTF-8 in {}: {}", what, e)))
    }
}
