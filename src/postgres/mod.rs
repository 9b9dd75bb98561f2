pub mod connection;
pub mod decoder;
pub mod protocol;
pub mod relation;
pub mod types;
pub mod values;

#[cfg(test)]
pub(crate) mod test_utils;


pub use connection::ReplicationConnection;
pub use decoder::decode;
pub use protocol::{PrimaryKeepAlive, ReplicationMessage, XLogData};
pub use relation::RelationCache;
pub use types::*;
pub use values::{Cell, ColumnValue, TypeRegistry};
