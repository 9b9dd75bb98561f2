//! Error types and result handling for pg-apply.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Only conditions that stop the pipeline are represented here. Recoverable
//! decode conditions (unknown column types, unknown message tags, receive
//! deadlines) are handled where they occur and never surface as an `Err`.
//!
//! # Example
//!
//! ```rust
//! use pg_apply::{Error, Result};
//!
//! fn lookup(relation_id: u32) -> Result<()> {
//!     Err(Error::UnknownRelation { relation_id })
//! }
//!
//! match lookup(16384) {
//!     Ok(()) => println!("found"),
//!     Err(Error::UnknownRelation { relation_id }) => eprintln!("no schema for {}", relation_id),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;
use tokio_postgres::types::PgLsn;

/// The main error type for pg-apply operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment override.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error raised by the target store client.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// I/O error on the replication connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The replication connection failed or was closed by the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with the source server.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A change buffer or copy-data frame could not be decoded.
    ///
    /// The byte stream cannot be trusted past this point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A row event referenced a relation whose definition was never received.
    #[error("Unknown relation ID: {relation_id}")]
    UnknownRelation {
        /// Relation identifier carried by the offending event
        relation_id: u32,
    },

    /// The source server answered with an `ErrorResponse`.
    #[error("Server error {code} ({severity}): {message}")]
    Server {
        /// Severity field (`ERROR`, `FATAL`, ...)
        severity: String,
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// An update or delete could not be keyed against the target.
    #[error("Relation {relation} has no usable identity for {operation}")]
    MissingIdentity {
        /// Qualified relation name
        relation: String,
        /// Operation that required the identity
        operation: &'static str,
    },

    /// The grouped write for a batch was rejected by the target store.
    #[error("Failed to apply batch ending at LSN {commit_lsn}: {source}")]
    Flush {
        /// Commit position of the last transaction in the rejected batch
        commit_lsn: PgLsn,
        /// Underlying store error
        #[source]
        source: Box<Error>,
    },

    /// The queue between the stream consumer and the apply task was closed
    /// because the other side terminated.
    #[error("Change queue closed")]
    QueueClosed,

    /// A pipeline task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns the SQLSTATE code when the error came from the source server.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// A convenient Result type alias for pg-apply operations.
///
/// This is equivalent to `std::result::Result<T, pg_apply::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
