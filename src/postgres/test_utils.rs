use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::PG_EPOCH_UNIX_MICROS;

/// A column value as written by the mock builder.
#[derive(Debug, Clone, Copy)]
pub enum MockValue<'a> {
    Null,
    Unchanged,
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Builds raw pgoutput messages for decoder and apply tests.
///
/// `stream_xid` mimics the extra transaction id carried by messages sent
/// inside a streamed transaction.
pub struct MockMessageBuilder {
    timestamp: i64,
    stream_xid: Option<u32>,
}

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            timestamp: 1697365800000000 - PG_EPOCH_UNIX_MICROS, // 2023-10-15 10:30:00 UTC
            stream_xid: None,
        }
    }

    pub fn streaming(mut self, xid: u32) -> Self {
        self.stream_xid = Some(xid);
        self
    }

    fn put_xid(&self, buf: &mut BytesMut) {
        if let Some(xid) = self.stream_xid {
            buf.put_u32(xid);
        }
    }

    pub fn begin(&self, final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(&self, commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    /// `columns` are `(name, type oid, is_key)`.
    pub fn relation(&self, relation_id: u32, namespace: &str, name: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        self.put_xid(&mut buf);
        buf.put_u32(relation_id);
        put_cstr(&mut buf, namespace);
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

    pub fn type_message(&self, type_id: u32, namespace: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Y');
        self.put_xid(&mut buf);
        buf.put_u32(type_id);
        put_cstr(&mut buf, namespace);
        put_cstr(&mut buf, name);
        buf.freeze()
    }

    pub fn insert(&self, relation_id: u32, values: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        self.put_xid(&mut buf);
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// `old` is `(marker, values)` with marker `b'K'` or `b'O'`.
    pub fn update(&self, relation_id: u32, old: Option<(u8, &[MockValue<'_>])>, new: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        self.put_xid(&mut buf);
        buf.put_u32(relation_id);
        if let Some((marker, values)) = old {
            buf.put_u8(marker);
            put_tuple(&mut buf, values);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        buf.freeze()
    }

    pub fn delete(&self, relation_id: u32, marker: u8, old: &[MockValue<'_>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        self.put_xid(&mut buf);
        buf.put_u32(relation_id);
        buf.put_u8(marker);
        put_tuple(&mut buf, old);
        buf.freeze()
    }

    pub fn truncate(&self, relation_ids: &[u32], options: u8) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        self.put_xid(&mut buf);
        buf.put_u32(relation_ids.len() as u32);
        buf.put_u8(options);
        for relation_id in relation_ids {
            buf.put_u32(*relation_id);
        }
        buf.freeze()
    }

    pub fn message(&self, transactional: bool, lsn: u64, prefix: &str, content: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        self.put_xid(&mut buf);
        buf.put_u8(u8::from(transactional));
        buf.put_u64(lsn);
        put_cstr(&mut buf, prefix);
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
        buf.freeze()
    }

    pub fn stream_start(&self, xid: u32, first_segment: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_u32(xid);
        buf.put_u8(u8::from(first_segment));
        buf.freeze()
    }

    pub fn stream_stop(&self) -> Bytes {
        Bytes::from_static(b"E")
    }

    pub fn stream_commit(&self, xid: u32, commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'c');
        buf.put_u32(xid);
        buf.put_u8(0);
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn stream_abort(&self, xid: u32, sub_xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'A');
        buf.put_u32(xid);
        buf.put_u32(sub_xid);
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue<'_>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Unchanged => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            MockValue::Binary(raw) => {
                buf.put_u8(b'b');
                buf.put_u32(raw.len() as u32);
                buf.put_slice(raw);
            }
        }
    }
}
