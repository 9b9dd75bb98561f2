use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_postgres::types::PgLsn;

pub type Oid = u32;
pub type Xid = u32;

/// One column of a tuple as it appears on the wire, before type decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleColumn {
    Null,
    /// A TOASTed value that did not change and was therefore not sent.
    UnchangedToast,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TupleData {
    pub columns: Vec<TupleColumn>,
}

impl TupleData {
    pub fn new(columns: Vec<TupleColumn>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// The "before" image attached to updates and deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum OldTuple {
    /// Only the replica identity columns are populated (`K`).
    Key(TupleData),
    /// The full previous row, sent for `REPLICA IDENTITY FULL` (`O`).
    Full(TupleData),
}

impl OldTuple {
    pub fn tuple(&self) -> &TupleData {
        match self {
            OldTuple::Key(tuple) | OldTuple::Full(tuple) => tuple,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'd' => Some(ReplicaIdentity::Default),
            b'n' => Some(ReplicaIdentity::Nothing),
            b'f' => Some(ReplicaIdentity::Full),
            b'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_id: Oid,
    pub type_modifier: i32,
    /// Part of the relation's replica identity.
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationSchema {
    pub relation_id: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnSchema>,
}

impl RelationSchema {
    /// Quoted `"namespace"."name"`, usable verbatim in SQL.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            pg_escape::quote_identifier(&self.name).into_owned()
        } else {
            format!(
                "{}.{}",
                pg_escape::quote_identifier(&self.namespace),
                pg_escape::quote_identifier(&self.name)
            )
        }
    }

    pub fn has_key_columns(&self) -> bool {
        self.columns.iter().any(|c| c.is_key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginBody {
    pub final_lsn: PgLsn,
    pub timestamp: DateTime<Utc>,
    pub xid: Xid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: PgLsn,
    pub end_lsn: PgLsn,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginBody {
    pub commit_lsn: PgLsn,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeBody {
    pub xid: Option<Xid>,
    pub type_id: Oid,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertBody {
    pub xid: Option<Xid>,
    pub relation_id: Oid,
    pub tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBody {
    pub xid: Option<Xid>,
    pub relation_id: Oid,
    pub old: Option<OldTuple>,
    pub new: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBody {
    pub xid: Option<Xid>,
    pub relation_id: Oid,
    pub old: OldTuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateBody {
    pub xid: Option<Xid>,
    pub relation_ids: Vec<Oid>,
    pub cascade: bool,
    pub restart_identity: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessageBody {
    pub xid: Option<Xid>,
    pub transactional: bool,
    pub lsn: PgLsn,
    pub prefix: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStartBody {
    pub xid: Xid,
    pub first_segment: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamCommitBody {
    pub xid: Xid,
    pub flags: u8,
    pub commit_lsn: PgLsn,
    pub end_lsn: PgLsn,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamAbortBody {
    pub xid: Xid,
    pub sub_xid: Xid,
}

/// One decoded pgoutput message.
///
/// Every consumer matches on this exhaustively, so a new variant forces a
/// review of all apply-side handling.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Relation(RelationSchema),
    Type(TypeBody),
    Origin(OriginBody),
    Begin(BeginBody),
    Commit(CommitBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    Message(LogicalMessageBody),
    StreamStart(StreamStartBody),
    StreamStop,
    StreamCommit(StreamCommitBody),
    StreamAbort(StreamAbortBody),
    /// A message tag this decoder does not know; carried so it can be logged.
    Unknown(u8),
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Relation(_) => "RELATION",
            ChangeEvent::Type(_) => "TYPE",
            ChangeEvent::Origin(_) => "ORIGIN",
            ChangeEvent::Begin(_) => "BEGIN",
            ChangeEvent::Commit(_) => "COMMIT",
            ChangeEvent::Insert(_) => "INSERT",
            ChangeEvent::Update(_) => "UPDATE",
            ChangeEvent::Delete(_) => "DELETE",
            ChangeEvent::Truncate(_) => "TRUNCATE",
            ChangeEvent::Message(_) => "MESSAGE",
            ChangeEvent::StreamStart(_) => "STREAM START",
            ChangeEvent::StreamStop => "STREAM STOP",
            ChangeEvent::StreamCommit(_) => "STREAM COMMIT",
            ChangeEvent::StreamAbort(_) => "STREAM ABORT",
            ChangeEvent::Unknown(_) => "UNKNOWN",
        }
    }
}
