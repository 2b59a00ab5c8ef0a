//! Error types surfaced by message handlers.

use thiserror::Error;

use crate::protocol::MessageType;

/// Local structural validation failures for a value record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record key is empty")]
    EmptyKey,
    #[error("record carries a signature but no author")]
    MissingAuthor,
    #[error("record value is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },
}

/// Why a handler refused or failed to process an inbound message.
///
/// Malformed requests and validation failures are reported to the caller.
/// Stale records, spoofed announcements and fan-out failures never reach
/// this type; handlers absorb them.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0} request carried no key")]
    MissingKey(MessageType),
    #[error("PUT_VALUE request carried no record")]
    MissingRecord,
    #[error("invalid content identifier: {0}")]
    InvalidContentId(String),
    #[error("bad record: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("datastore holds a malformed record under {key}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("routing oracle failed: {0}")]
    Routing(#[source] anyhow::Error),
    #[error("no handler registered for {0}")]
    Unhandled(MessageType),
}
