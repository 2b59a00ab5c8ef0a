//! # Tiered DHT
//!
//! This crate implements the responder side of a Kademlia-style distributed
//! hash table node: given an inbound protocol message and the identity of its
//! sender, produce the response and update local state. On top of the usual
//! value, provider and discovery messages it runs ADD_FILE, a leveled
//! replication protocol that pushes a content key from an originator through
//! a tier of super peers down to leaves that pin it.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: identities, XOR distance, the routing table, the collaborator
//!   traits handlers consume, and the [`DhtNode`] that ties them together.
//! - [`protocol`]: the JSON serialisable wire messages and the decoding of
//!   the overloaded `cluster_level` field.
//! - [`record`]: record cleaning, validation, freshness and storage keys.
//! - [`handlers`]: the dispatch table and the value, provider and discovery
//!   handlers.
//! - [`replication`]: the ADD_FILE broadcast, relay and leaf phases.
//! - [`store`] and [`pin`]: in-memory default collaborators.
//! - [`net`], [`framing`], [`server`]: a TCP transport and the matching
//!   connection handler.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use tiered_dht::{Contact, DhtConfig, DhtNode, MemoryPeerDirectory, TcpTransport};
//! use tokio::net::TcpListener;
//!
//! # async fn launch() -> Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:4100").await?;
//! let id = tiered_dht::derive_node_id(b"my public key");
//! let self_contact = Contact::new(id, vec![listener.local_addr()?.to_string()]);
//!
//! let config = DhtConfig::default();
//! let directory = Arc::new(MemoryPeerDirectory::default());
//! let transport = Arc::new(TcpTransport::new(self_contact.clone(), directory.clone(), &config));
//! let node = Arc::new(
//!     DhtNode::builder(self_contact, transport)
//!         .config(config)
//!         .directory(directory)
//!         .build(),
//! );
//! tiered_dht::serve(node, listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod net;
pub mod pin;
pub mod protocol;
pub mod record;
pub mod replication;
pub mod server;
pub mod store;

pub use config::DhtConfig;
pub use core::{
    derive_node_id, keyspace_position, xor_distance, Contact, DhtNode, DhtNodeBuilder,
    NodeContext, NodeId, PeerDirectory, PinExecutor, ProviderTable, RecordStore, RoutingOracle,
    RoutingTable, SuperPeerSource, Transport,
};
pub use error::{HandlerError, RecordError};
pub use handlers::{Dispatcher, MessageHandler};
pub use net::TcpTransport;
pub use pin::{LocalPinSet, PinWorker, Pinner, PIN_OK};
pub use protocol::{ContentId, Message, MessageType, PinAck, Record, ReplicationLevel};
pub use replication::RelayOutcome;
pub use server::{handle_connection, serve};
pub use store::{
    MemoryPeerDirectory, MemoryProviderTable, MemoryRecordStore, SelfSuperPeer, StaticSuperPeers,
    TableRoutingOracle,
};
