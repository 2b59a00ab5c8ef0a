//! Core DHT building blocks shared by every handler.
//!
//! - **Identity & Hashing**: [`NodeId`], [`derive_node_id`], [`keyspace_position`]
//! - **Distance Metrics**: [`xor_distance`] for Kademlia-style routing
//! - **Routing**: [`RoutingTable`], [`Contact`] for peer management
//! - **Collaborators**: the narrow traits the handlers consume
//!   ([`RecordStore`], [`ProviderTable`], [`PeerDirectory`], [`RoutingOracle`],
//!   [`SuperPeerSource`], [`Transport`], [`PinExecutor`])
//! - **Node**: [`NodeContext`] (the per-node handle set passed to handlers)
//!   and [`DhtNode`], which owns it together with the dispatch table

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use iroh_blake3::Hasher;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::time::Duration;
use tracing::debug;

use crate::config::DhtConfig;
use crate::error::HandlerError;
use crate::handlers::{Dispatcher, MessageHandler};
use crate::pin::{LocalPinSet, PinWorker};
use crate::protocol::{ContentId, Message, MessageType};
use crate::record::{RecordValidator, StructuralValidator};
use crate::store::{
    MemoryPeerDirectory, MemoryProviderTable, MemoryRecordStore, SelfSuperPeer, TableRoutingOracle,
};

// ============================================================================
// Identity & Hashing
// ============================================================================

/// A 256-bit identifier for DHT nodes.
///
/// Node IDs are derived from the node's public key using BLAKE3 hashing,
/// ensuring a uniform distribution across the identifier space.
pub type NodeId = [u8; 32];

/// Compute a 32-byte BLAKE3 digest of the input data.
fn blake3_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable 32-byte [`NodeId`] by hashing arbitrary input with BLAKE3.
///
/// ```
/// use tiered_dht::derive_node_id;
///
/// let node_id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(node_id.len(), 32);
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_digest(data)
}

/// Map arbitrary bytes (a DHT key, a content id, a peer id) onto the
/// keyspace in which XOR distances are measured.
///
/// Keys and peer identifiers are both hashed so that lookups for either land
/// in the same space.
pub fn keyspace_position(data: &[u8]) -> [u8; 32] {
    blake3_digest(data)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// Compute the XOR distance between two keyspace positions.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]` (reflexive)
/// - `xor_distance(a, b) == xor_distance(b, a)` (symmetric)
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Sort peers by the distance of their keyspace position to `target`.
///
/// Each position is hashed once; distances compare lexicographically.
pub(crate) fn sort_by_distance(peers: &mut [NodeId], target: &[u8; 32]) {
    peers.sort_by_cached_key(|peer| xor_distance(&keyspace_position(peer), target));
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Find the bucket index for a keyspace position relative to our own.
///
/// The bucket index is the position of the first differing bit (0..=255).
/// Bucket 0 is the furthest (most different), bucket 255 is the closest.
fn bucket_index(local: &[u8; 32], other: &[u8; 32]) -> usize {
    let dist = xor_distance(local, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize; // 0..7
            return byte_idx * 8 + leading;
        }
    }
    // identical position: put in the "last" bucket
    255
}

/// A peer together with the addresses it can be reached on.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Contact {
    /// The node's unique identifier.
    pub id: NodeId,
    /// Transport addresses, e.g. `host:port` for the TCP transport.
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    pub fn has_addrs(&self) -> bool {
        !self.addrs.is_empty()
    }
}

/// A single Kademlia routing bucket with LRU-like behavior.
///
/// Maintains up to k peers, preferring long-lived nodes (older entries)
/// over newly discovered ones to improve routing stability.
#[derive(Debug, Default, Clone)]
struct Bucket {
    /// Peers in LRU order (oldest first, newest last).
    peers: Vec<NodeId>,
}

/// Outcome of attempting to add or refresh a peer in a bucket.
#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket is full; includes the oldest peer for potential eviction.
    Full { new_peer: NodeId, oldest: NodeId },
}

/// Pending bucket update when a bucket is full and the oldest peer needs a ping.
#[derive(Clone, Debug)]
pub(crate) struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: NodeId,
    new_peer: NodeId,
}

impl Bucket {
    fn touch(&mut self, peer: NodeId, k: usize) -> BucketTouchOutcome {
        if self.refresh(&peer) {
            return BucketTouchOutcome::Refreshed;
        }

        match self.peers.first() {
            Some(oldest) if self.peers.len() >= k => BucketTouchOutcome::Full {
                new_peer: peer,
                oldest: *oldest,
            },
            _ => {
                self.peers.push(peer);
                BucketTouchOutcome::Inserted
            }
        }
    }

    /// Move a peer to the end of the LRU queue. Returns false if absent.
    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p == id) {
            let existing = self.peers.remove(pos);
            self.peers.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.peers.iter().position(|p| p == id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Kademlia routing table with 256 buckets over the hashed keyspace.
///
/// Each bucket stores up to k peers whose keyspace position shares a prefix of
/// a given length with ours. The local node is never stored.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    local_position: [u8; 32],
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            local_position: keyspace_position(&self_id),
            k,
            buckets: vec![Bucket::default(); 256],
        }
    }

    /// Add or refresh a peer, dropping it silently if its bucket is full.
    pub fn update(&mut self, peer: NodeId) {
        let _ = self.update_with_pending(peer);
    }

    /// Add or refresh a peer, returning pending update info if the bucket is full.
    ///
    /// The caller pings the returned oldest peer and feeds the answer to
    /// [`apply_ping_result`](Self::apply_ping_result).
    pub(crate) fn update_with_pending(&mut self, peer: NodeId) -> Option<PendingBucketUpdate> {
        if peer == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.local_position, &keyspace_position(&peer));
        match self.buckets[idx].touch(peer, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { new_peer, oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest,
                new_peer,
            }),
        }
    }

    pub fn remove(&mut self, peer: &NodeId) -> bool {
        let idx = bucket_index(&self.local_position, &keyspace_position(peer));
        self.buckets[idx].remove(peer)
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        let idx = bucket_index(&self.local_position, &keyspace_position(peer));
        self.buckets[idx].peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the `count` peers closest to a keyspace position.
    pub fn closest(&self, target: &[u8; 32], count: usize) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().copied())
            .collect();
        sort_by_distance(&mut all, target);
        all.truncate(count);
        all
    }

    /// Find the `count` peers closest to the position of an arbitrary key.
    pub fn closest_to_key(&self, key: &[u8], count: usize) -> Vec<NodeId> {
        self.closest(&keyspace_position(key), count)
    }

    /// Apply the result of pinging the oldest peer in a full bucket.
    ///
    /// A live oldest peer is refreshed and the newcomer dropped; a dead one is
    /// replaced by the newcomer.
    pub(crate) fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest);
            return;
        }

        bucket.remove(&pending.oldest);
        if bucket.peers.contains(&pending.new_peer) {
            return;
        }
        if bucket.peers.len() < self.k {
            bucket.peers.push(pending.new_peer);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque key/value persistence keyed by [`crate::record::storage_key`].
///
/// Implementations must be safe for concurrent use; handlers add no locking.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// `Ok(None)` means not found, which is not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn has(&self, key: &str) -> Result<bool>;
}

/// Which peers claim to provide a content identifier.
#[async_trait]
pub trait ProviderTable: Send + Sync + 'static {
    async fn add_provider(&self, cid: &ContentId, provider: NodeId);
    async fn providers(&self, cid: &ContentId) -> Vec<NodeId>;
}

/// Address book resolving peer identifiers to transport addresses.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    async fn resolve(&self, peer: &NodeId) -> Vec<String>;
    /// Merge `addrs` for `peer`, each valid for `lease`.
    async fn add_addrs(&self, peer: &NodeId, addrs: &[String], lease: Duration);
}

/// Peer selection for a target key.
#[async_trait]
pub trait RoutingOracle: Send + Sync + 'static {
    /// Up to `count` peers closer to `target`, never including `exclude` or
    /// the local node.
    async fn closer_peers(&self, target: &[u8], exclude: &NodeId, count: usize) -> Vec<NodeId>;

    /// Super peers responsible for relaying `target` to its leaves.
    async fn closest_super_peers(&self, target: &[u8]) -> Result<Vec<NodeId>>;

    /// Leaf candidates for `target`.
    async fn closest_peers(&self, target: &[u8]) -> Result<Vec<NodeId>>;
}

/// Source of the super-peer tier used by [`RoutingOracle::closest_super_peers`].
pub trait SuperPeerSource: Send + Sync + 'static {
    fn closest_super_peers(&self, target: &[u8]) -> Vec<NodeId>;
}

/// Network abstraction for sending protocol messages to peers.
///
/// Timeouts and cancellation are the transport's responsibility.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget delivery.
    async fn send(&self, to: &NodeId, message: Message) -> Result<()>;

    /// Deliver `message` and wait for the peer's reply.
    async fn request(&self, to: &NodeId, message: Message) -> Result<Message>;
}

/// Local durable pinning.
///
/// Each submission yields exactly one status on the returned channel:
/// [`crate::pin::PIN_OK`] on success, anything else on failure.
pub trait PinExecutor: Send + Sync + 'static {
    fn submit(&self, key: Vec<u8>) -> oneshot::Receiver<String>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a handler may touch while processing one message.
///
/// The shared collaborators are injected handles; their concurrency safety is
/// part of their own contract.
pub struct NodeContext {
    pub id: NodeId,
    pub self_contact: Contact,
    pub config: DhtConfig,
    pub store: Arc<dyn RecordStore>,
    pub providers: Arc<dyn ProviderTable>,
    pub directory: Arc<dyn PeerDirectory>,
    pub routing: Arc<dyn RoutingOracle>,
    pub transport: Arc<dyn Transport>,
    pub pins: Arc<dyn PinExecutor>,
    pub validator: Arc<dyn RecordValidator>,
}

impl NodeContext {
    /// Resolve a peer into a contact. The local node answers with its own contact.
    pub async fn peer_info(&self, peer: &NodeId) -> Contact {
        if *peer == self.id {
            return self.self_contact.clone();
        }
        Contact::new(*peer, self.directory.resolve(peer).await)
    }

    pub async fn peer_infos(&self, peers: &[NodeId]) -> Vec<Contact> {
        let mut infos = Vec::with_capacity(peers.len());
        for peer in peers {
            infos.push(self.peer_info(peer).await);
        }
        infos
    }
}

/// A DHT node answering inbound protocol messages.
///
/// The node owns the routing table it learns from inbound traffic, the
/// [`NodeContext`] handed to every handler, and the [`Dispatcher`] mapping
/// message types to handlers. It is `Arc`-friendly and can be shared between
/// connection tasks.
pub struct DhtNode {
    pub id: NodeId,
    pub self_contact: Contact,
    context: Arc<NodeContext>,
    dispatcher: Dispatcher,
    table: Arc<Mutex<RoutingTable>>,
    one_way_permits: Arc<Semaphore>,
}

impl DhtNode {
    /// Start building a node. Only the transport is mandatory; every other
    /// collaborator defaults to the in-memory implementations in [`crate::store`]
    /// and [`crate::pin`].
    pub fn builder(self_contact: Contact, transport: Arc<dyn Transport>) -> DhtNodeBuilder {
        DhtNodeBuilder::new(self_contact, transport)
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn config(&self) -> &DhtConfig {
        &self.context.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Permits bounding how many fire-and-forget messages are handled at once.
    pub fn one_way_permits(&self) -> &Arc<Semaphore> {
        &self.one_way_permits
    }

    /// Handle one inbound message from `from`.
    ///
    /// `Ok(None)` means the handler produces no response.
    pub async fn handle_message(
        &self,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let handler = self
            .dispatcher
            .handler_for(message.kind)
            .ok_or(HandlerError::Unhandled(message.kind))?;
        handler.handle(&self.context, from, message).await
    }

    /// Record a peer that contacted us: merge its addresses into the
    /// directory and insert it in the routing table.
    ///
    /// If the bucket for this peer is full, spawns a background task to ping
    /// the oldest entry and decide whether to evict it.
    pub async fn observe_contact(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }
        if contact.has_addrs() {
            self.context
                .directory
                .add_addrs(&contact.id, &contact.addrs, self.config().peer_addr_ttl())
                .await;
        }
        let pending = {
            let mut rt = self.table.lock().await;
            rt.update_with_pending(contact.id)
        };
        if let Some(update) = pending {
            self.spawn_bucket_refresh(update);
        }
    }

    /// Ping the oldest peer of a full bucket (Kademlia ping-before-evict).
    fn spawn_bucket_refresh(&self, pending: PendingBucketUpdate) {
        let transport = self.context.transport.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let ping = Message::new(MessageType::Ping, Vec::new(), 0);
            let alive = match transport.request(&pending.oldest, ping).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(peer = %hex::encode(pending.oldest), "ping failed: {err:?}");
                    false
                }
            };
            let mut rt = table.lock().await;
            rt.apply_ping_result(pending, alive);
        });
    }

    /// Number of peers currently in the routing table.
    pub async fn routing_table_len(&self) -> usize {
        self.table.lock().await.len()
    }
}

/// Builder for [`DhtNode`].
pub struct DhtNodeBuilder {
    self_contact: Contact,
    transport: Arc<dyn Transport>,
    config: DhtConfig,
    store: Option<Arc<dyn RecordStore>>,
    providers: Option<Arc<dyn ProviderTable>>,
    directory: Option<Arc<dyn PeerDirectory>>,
    routing: Option<Arc<dyn RoutingOracle>>,
    super_peers: Option<Arc<dyn SuperPeerSource>>,
    pins: Option<Arc<dyn PinExecutor>>,
    validator: Option<Arc<dyn RecordValidator>>,
    dispatcher: Dispatcher,
}

impl DhtNodeBuilder {
    fn new(self_contact: Contact, transport: Arc<dyn Transport>) -> Self {
        Self {
            self_contact,
            transport,
            config: DhtConfig::default(),
            store: None,
            providers: None,
            directory: None,
            routing: None,
            super_peers: None,
            pins: None,
            validator: None,
            dispatcher: Dispatcher::standard(),
        }
    }

    pub fn config(mut self, config: DhtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn providers(mut self, providers: Arc<dyn ProviderTable>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Replace the routing-table backed oracle entirely.
    pub fn routing(mut self, routing: Arc<dyn RoutingOracle>) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Super-peer tier used by the default oracle. Defaults to [`SelfSuperPeer`].
    pub fn super_peers(mut self, source: Arc<dyn SuperPeerSource>) -> Self {
        self.super_peers = Some(source);
        self
    }

    pub fn pins(mut self, pins: Arc<dyn PinExecutor>) -> Self {
        self.pins = Some(pins);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Register or replace the handler for a message type.
    pub fn handler(mut self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.dispatcher.register(kind, handler);
        self
    }

    pub fn build(self) -> DhtNode {
        let id = self.self_contact.id;
        let config = self.config;
        let table = Arc::new(Mutex::new(RoutingTable::new(id, config.bucket_size)));
        let one_way_permits = Arc::new(Semaphore::new(config.max_inflight_one_way.max(1)));

        let routing = self.routing.unwrap_or_else(|| {
            let super_peers = self
                .super_peers
                .unwrap_or_else(|| Arc::new(SelfSuperPeer::new(id)));
            Arc::new(TableRoutingOracle::new(
                id,
                table.clone(),
                super_peers,
                config.bucket_size,
            ))
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new(config.record_cache_entries)));
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(MemoryProviderTable::new(config.provider_validity())));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(MemoryPeerDirectory::default()));
        let pins = self.pins.unwrap_or_else(|| {
            Arc::new(PinWorker::new(
                Arc::new(LocalPinSet::default()),
                config.max_concurrent_pins,
            ))
        });
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(StructuralValidator::new(config.max_record_size)));

        let context = NodeContext {
            id,
            self_contact: self.self_contact.clone(),
            config,
            store,
            providers,
            directory,
            routing,
            transport: self.transport,
            pins,
            validator,
        };

        DhtNode {
            id,
            self_contact: self.self_contact,
            context: Arc::new(context),
            dispatcher: self.dispatcher,
            table,
            one_way_permits,
        }
    }
}
