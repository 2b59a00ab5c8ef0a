//! DHT protocol message definitions.
//!
//! This module defines the messages exchanged between peers, the value
//! [`Record`] they carry, and the [`ReplicationLevel`] decoding of the
//! overloaded `cluster_level` field used by the ADD_FILE protocol. All
//! messages are serde-serialisable; the TCP transport frames them as JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{Contact, NodeId};
use crate::error::HandlerError;

/// Number of closer peers returned by responders.
pub const CLOSER_PEER_COUNT: usize = 20;

/// Freshness window for records authored by other peers (36 hours).
pub const MAX_RECORD_AGE_SECS: u64 = 36 * 60 * 60;

/// Longest byte string accepted as a content identifier.
pub const MAX_CONTENT_ID_LEN: usize = 512;

/// Added to the level of a broadcast message when it is handed to super peers.
pub const LEVEL_RELAY_BASE: i32 = 10;

/// Levels at or above this value address a leaf.
pub const LEVEL_LEAF_THRESHOLD: i32 = 20;

/// Level carried by relay-to-leaf requests.
pub const LEVEL_IN_RELAY: i32 = 50;

/// Leaf reply level: the pin succeeded.
pub const LEVEL_PIN_OK: i32 = 88;

/// Leaf reply level: the pin failed.
pub const LEVEL_PIN_FAILED: i32 = 99;

/// Every message kind understood on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
    AddFile,
    RemoveFile,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::PutValue,
        MessageType::GetValue,
        MessageType::AddProvider,
        MessageType::GetProviders,
        MessageType::FindNode,
        MessageType::Ping,
        MessageType::AddFile,
        MessageType::RemoveFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::PutValue => "PUT_VALUE",
            MessageType::GetValue => "GET_VALUE",
            MessageType::AddProvider => "ADD_PROVIDER",
            MessageType::GetProviders => "GET_PROVIDERS",
            MessageType::FindNode => "FIND_NODE",
            MessageType::Ping => "PING",
            MessageType::AddFile => "ADD_FILE",
            MessageType::RemoveFile => "REMOVE_FILE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value.
///
/// `time_received` is assigned by the node that accepted the record and is
/// only meaningful locally. Fields this version does not know about are kept
/// in `unrecognized` so cleaning can scrub them before storage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_received: Option<String>,
    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, serde_json::Value>,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Self::default()
        }
    }

    /// Attach an author together with its signature.
    pub fn signed(mut self, author: NodeId, signature: impl Into<Vec<u8>>) -> Self {
        self.author = Some(author);
        self.signature = Some(signature.into());
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().is_some_and(|sig| !sig.is_empty())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The unit of protocol exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default)]
    pub closer_peers: Vec<Contact>,
    #[serde(default)]
    pub provider_peers: Vec<Contact>,
    /// Routing hint for ordinary queries, phase counter for ADD_FILE.
    #[serde(default)]
    pub cluster_level: i32,
}

impl Message {
    pub fn new(kind: MessageType, key: impl Into<Vec<u8>>, cluster_level: i32) -> Self {
        Self {
            kind,
            key: key.into(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
            cluster_level,
        }
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_provider(mut self, provider: Contact) -> Self {
        self.provider_peers.push(provider);
        self
    }
}

/// A validated content identifier.
///
/// Identifiers are opaque to this crate: any non-empty byte string up to
/// [`MAX_CONTENT_ID_LEN`] bytes is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(Vec<u8>);

impl ContentId {
    pub fn parse(bytes: &[u8]) -> Result<Self, HandlerError> {
        if bytes.is_empty() {
            return Err(HandlerError::InvalidContentId(
                "empty identifier".to_string(),
            ));
        }
        if bytes.len() > MAX_CONTENT_ID_LEN {
            return Err(HandlerError::InvalidContentId(format!(
                "{} bytes exceeds the {MAX_CONTENT_ID_LEN} byte limit",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => f.write_str(text),
            _ => f.write_str(&hex::encode(&self.0)),
        }
    }
}

/// Phase of an ADD_FILE request, decoded from `cluster_level`.
///
/// | level            | phase                          |
/// |------------------|--------------------------------|
/// | `< 10`           | [`Broadcast`](Self::Broadcast) |
/// | `10 ..= 19`      | [`Relay`](Self::Relay)         |
/// | `>= 20`          | [`Leaf`](Self::Leaf)           |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationLevel {
    /// Fan out to the super-peer set. `hint` becomes the relay target.
    Broadcast { hint: i32 },
    /// Relay to leaf candidates until `remaining` of them confirm.
    Relay { remaining: i32 },
    /// Pin locally and acknowledge.
    Leaf,
}

impl ReplicationLevel {
    pub fn decode(level: i32) -> Self {
        if level < LEVEL_RELAY_BASE {
            ReplicationLevel::Broadcast { hint: level }
        } else if level < LEVEL_LEAF_THRESHOLD {
            ReplicationLevel::Relay {
                remaining: level - LEVEL_RELAY_BASE,
            }
        } else {
            ReplicationLevel::Leaf
        }
    }

    pub fn encode(self) -> i32 {
        match self {
            ReplicationLevel::Broadcast { hint } => hint,
            ReplicationLevel::Relay { remaining } => remaining + LEVEL_RELAY_BASE,
            ReplicationLevel::Leaf => LEVEL_IN_RELAY,
        }
    }
}

/// A leaf's answer to a relay request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinAck {
    Confirmed,
    Failed,
}

impl PinAck {
    /// Decode a reply level. Any value other than the two sentinels is not an ack.
    pub fn decode(level: i32) -> Option<Self> {
        match level {
            LEVEL_PIN_OK => Some(PinAck::Confirmed),
            LEVEL_PIN_FAILED => Some(PinAck::Failed),
            _ => None,
        }
    }

    pub fn encode(self) -> i32 {
        match self {
            PinAck::Confirmed => LEVEL_PIN_OK,
            PinAck::Failed => LEVEL_PIN_FAILED,
        }
    }
}

/// A framed request as written by the TCP transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's contact information.
    pub from: Contact,
    pub message: Message,
    /// `false` for fire-and-forget sends; the server writes no reply.
    pub expects_reply: bool,
}

/// The server's answer to an [`Envelope`] that expects a reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replication_level_boundaries() {
        assert_eq!(
            ReplicationLevel::decode(0),
            ReplicationLevel::Broadcast { hint: 0 }
        );
        assert_eq!(
            ReplicationLevel::decode(9),
            ReplicationLevel::Broadcast { hint: 9 }
        );
        assert_eq!(
            ReplicationLevel::decode(10),
            ReplicationLevel::Relay { remaining: 0 }
        );
        assert_eq!(
            ReplicationLevel::decode(13),
            ReplicationLevel::Relay { remaining: 3 }
        );
        assert_eq!(ReplicationLevel::decode(20), ReplicationLevel::Leaf);
        assert_eq!(ReplicationLevel::decode(50), ReplicationLevel::Leaf);
    }

    #[test]
    fn broadcast_hint_becomes_relay_target() {
        let relayed = ReplicationLevel::Relay { remaining: 2 }.encode();
        assert_eq!(relayed, 12);
        assert_eq!(
            ReplicationLevel::decode(relayed),
            ReplicationLevel::Relay { remaining: 2 }
        );
        assert_eq!(ReplicationLevel::Leaf.encode(), LEVEL_IN_RELAY);
    }

    #[test]
    fn pin_ack_only_recognises_sentinels() {
        assert_eq!(PinAck::decode(88), Some(PinAck::Confirmed));
        assert_eq!(PinAck::decode(99), Some(PinAck::Failed));
        assert_eq!(PinAck::decode(50), None);
        assert_eq!(PinAck::Failed.encode(), 99);
    }

    #[test]
    fn content_id_rejects_empty_and_oversized_keys() {
        assert!(ContentId::parse(b"").is_err());
        assert!(ContentId::parse(&vec![7u8; MAX_CONTENT_ID_LEN + 1]).is_err());
        let cid = ContentId::parse(b"cidX").expect("valid id");
        assert_eq!(cid.as_bytes(), b"cidX");
        assert_eq!(cid.to_string(), "cidX");
    }

    #[test]
    fn unknown_record_fields_are_preserved_until_cleaned() {
        let json = br#"{"value":[1,2],"time_received":"x","extension":true}"#;
        let record = Record::from_bytes(json).expect("decodes");
        assert_eq!(record.value, vec![1, 2]);
        assert_eq!(
            record.unrecognized.get("extension"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn message_type_uses_wire_names() {
        let encoded = serde_json::to_string(&MessageType::GetProviders).expect("encodes");
        assert_eq!(encoded, "\"GET_PROVIDERS\"");
        assert_eq!(MessageType::AddFile.to_string(), "ADD_FILE");
    }
}
