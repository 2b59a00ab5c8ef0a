//! Value-record policy: cleaning, local validation, freshness and the
//! storage-key encoding shared by every node using the same store.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use data_encoding::BASE32_NOPAD;
use thiserror::Error;

use crate::error::RecordError;
use crate::protocol::Record;

/// Encode a protocol key into a datastore key.
///
/// RFC 4648 base32 without padding behind a leading `/`, so keys written by
/// other implementations sharing the store resolve to the same entry.
pub fn storage_key(key: &[u8]) -> String {
    format!("/{}", BASE32_NOPAD.encode(key))
}

/// Strip everything a sender must not be able to set.
///
/// Unknown fields and the receive time are always dropped; the author is
/// dropped unless the record is signed. Cleaning is idempotent.
pub fn clean_record(record: &mut Record) {
    record.unrecognized.clear();
    record.time_received = None;
    if !record.is_signed() {
        record.author = None;
    }
}

/// Stamp a record with the local receive time.
pub fn stamp_received(record: &mut Record, now: DateTime<Utc>) {
    record.time_received = Some(now.to_rfc3339_opts(SecondsFormat::Nanos, true));
}

/// Parse the receive time written by [`stamp_received`].
pub fn received_at(record: &Record) -> Option<DateTime<Utc>> {
    let raw = record.time_received.as_deref()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// Why a stored record is no longer served.
#[derive(Debug, Error)]
pub enum Staleness {
    #[error("record has no receive time")]
    Unstamped,
    #[error("record receive time is unparsable: {0}")]
    Unparsable(#[from] chrono::ParseError),
    #[error("record is {age:?} old")]
    Expired { age: Duration },
}

/// Check that `record` was received within `max_age` of `now`.
///
/// Only timestamps are checked; verifying the content is left to the requester.
pub fn check_freshness(
    record: &Record,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<(), Staleness> {
    let raw = record.time_received.as_deref().ok_or(Staleness::Unstamped)?;
    let received = DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc);
    // Receive times in the future count as fresh.
    match now.signed_duration_since(received).to_std() {
        Ok(age) if age > max_age => Err(Staleness::Expired { age }),
        _ => Ok(()),
    }
}

/// Local structural validation applied to PUT_VALUE records.
pub trait RecordValidator: Send + Sync + 'static {
    fn validate(&self, key: &[u8], record: &Record) -> Result<(), RecordError>;
}

/// Checks shape only: a key is present, a signature comes with an author,
/// and the value stays under a size bound. Signatures are not verified.
#[derive(Clone, Debug)]
pub struct StructuralValidator {
    max_value_len: usize,
}

impl StructuralValidator {
    pub fn new(max_value_len: usize) -> Self {
        Self { max_value_len }
    }
}

impl RecordValidator for StructuralValidator {
    fn validate(&self, key: &[u8], record: &Record) -> Result<(), RecordError> {
        if key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        if record.is_signed() && record.author.is_none() {
            return Err(RecordError::MissingAuthor);
        }
        if record.value.len() > self.max_value_len {
            return Err(RecordError::TooLarge {
                len: record.value.len(),
                max: self.max_value_len,
            });
        }
        Ok(())
    }
}
