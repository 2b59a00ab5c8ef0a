//! In-memory collaborators used when a node is built without external ones.
//!
//! - [`MemoryRecordStore`]: LRU-bounded record storage
//! - [`MemoryProviderTable`]: provider records that expire
//! - [`MemoryPeerDirectory`]: addresses held under leases
//! - [`TableRoutingOracle`]: peer selection over the node's [`RoutingTable`]
//! - [`SelfSuperPeer`], [`StaticSuperPeers`]: super-peer tiers

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::core::{
    keyspace_position, sort_by_distance, NodeId, PeerDirectory, ProviderTable, RecordStore,
    RoutingOracle, RoutingTable, SuperPeerSource,
};
use crate::protocol::ContentId;

/// Fallback horizon for leases too long to represent as an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Minimum time between sweeps of a whole table for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn expiry(now: Instant, lease: Duration) -> Instant {
    now.checked_add(lease).unwrap_or(now + FAR_FUTURE)
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Record store backed by an LRU cache.
///
/// Once `capacity` entries are held, writing a new key evicts the least
/// recently used one.
pub struct MemoryRecordStore {
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl MemoryRecordStore {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cache = self.cache.lock().await;
        Ok(cache.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.put(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        cache.pop(key);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let cache = self.cache.lock().await;
        Ok(cache.contains(key))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// Provider table whose entries expire `validity` after their last announcement.
///
/// Expired entries are dropped when their identifier is looked up, and by a
/// sweep over the whole table at most once per [`SWEEP_INTERVAL`] when new
/// announcements arrive.
pub struct MemoryProviderTable {
    validity: Duration,
    state: Mutex<ProviderState>,
}

struct ProviderState {
    entries: HashMap<ContentId, Vec<(NodeId, Instant)>>,
    last_sweep: Instant,
}

impl ProviderState {
    fn maybe_expire_entries(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        let before = self.entries.len();
        self.entries.retain(|_, providers| {
            providers.retain(|(_, expires)| *expires > now);
            !providers.is_empty()
        });
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!(expired_count = expired, "removing expired provider records");
        }
    }
}

impl MemoryProviderTable {
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            state: Mutex::new(ProviderState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of content identifiers with at least one entry held.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }
}

#[async_trait]
impl ProviderTable for MemoryProviderTable {
    async fn add_provider(&self, cid: &ContentId, provider: NodeId) {
        let now = Instant::now();
        let expires = expiry(now, self.validity);
        let mut state = self.state.lock().await;
        state.maybe_expire_entries(now);
        let providers = state.entries.entry(cid.clone()).or_default();
        match providers.iter_mut().find(|(id, _)| *id == provider) {
            Some(entry) => entry.1 = expires,
            None => providers.push((provider, expires)),
        }
    }

    async fn providers(&self, cid: &ContentId) -> Vec<NodeId> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(providers) = state.entries.get_mut(cid) else {
            return Vec::new();
        };
        providers.retain(|(_, expires)| *expires > now);
        let live: Vec<NodeId> = providers.iter().map(|(id, _)| *id).collect();
        if live.is_empty() {
            state.entries.remove(cid);
        }
        live
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer Directory
// ─────────────────────────────────────────────────────────────────────────────

/// Address book where every address carries its own lease.
///
/// Re-adding an address extends its lease but never shortens it. A peer whose
/// addresses have all expired is forgotten, either when it is resolved or by
/// the periodic sweep run from [`PeerDirectory::add_addrs`].
pub struct MemoryPeerDirectory {
    state: Mutex<DirectoryState>,
}

struct DirectoryState {
    peers: HashMap<NodeId, BTreeMap<String, Instant>>,
    last_sweep: Instant,
}

impl DirectoryState {
    fn maybe_expire_leases(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;

        let before = self.peers.len();
        self.peers.retain(|_, addrs| {
            addrs.retain(|_, expires| *expires > now);
            !addrs.is_empty()
        });
        let expired = before - self.peers.len();
        if expired > 0 {
            debug!(expired_count = expired, "forgetting peers with expired addresses");
        }
    }
}

impl Default for MemoryPeerDirectory {
    fn default() -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                peers: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }
}

impl MemoryPeerDirectory {
    /// Number of peers with at least one address held.
    pub async fn len(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.peers.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for MemoryPeerDirectory {
    async fn resolve(&self, peer: &NodeId) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(addrs) = state.peers.get_mut(peer) else {
            return Vec::new();
        };
        addrs.retain(|_, expires| *expires > now);
        let live: Vec<String> = addrs.keys().cloned().collect();
        if live.is_empty() {
            state.peers.remove(peer);
        }
        live
    }

    async fn add_addrs(&self, peer: &NodeId, addrs: &[String], lease: Duration) {
        let now = Instant::now();
        let expires = expiry(now, lease);
        let mut state = self.state.lock().await;
        state.maybe_expire_leases(now);
        let known = state.peers.entry(*peer).or_default();
        for addr in addrs {
            let entry = known.entry(addr.clone()).or_insert(expires);
            if *entry < expires {
                *entry = expires;
            }
        }
        if known.is_empty() {
            state.peers.remove(peer);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

/// Super-peer tier of a node that knows no other super peers: itself.
#[derive(Clone, Debug)]
pub struct SelfSuperPeer {
    self_id: NodeId,
}

impl SelfSuperPeer {
    pub fn new(self_id: NodeId) -> Self {
        Self { self_id }
    }
}

impl SuperPeerSource for SelfSuperPeer {
    fn closest_super_peers(&self, _target: &[u8]) -> Vec<NodeId> {
        vec![self.self_id]
    }
}

/// A configured super-peer set, ranked by distance to the target.
///
/// An empty set falls back to [`SelfSuperPeer`] behaviour.
#[derive(Clone, Debug)]
pub struct StaticSuperPeers {
    fallback: SelfSuperPeer,
    peers: Vec<NodeId>,
    fanout: usize,
}

impl StaticSuperPeers {
    /// `fanout` bounds how many super peers a single broadcast reaches.
    pub fn new(self_id: NodeId, peers: Vec<NodeId>, fanout: usize) -> Self {
        Self {
            fallback: SelfSuperPeer::new(self_id),
            peers,
            fanout: fanout.max(1),
        }
    }
}

impl SuperPeerSource for StaticSuperPeers {
    fn closest_super_peers(&self, target: &[u8]) -> Vec<NodeId> {
        if self.peers.is_empty() {
            return self.fallback.closest_super_peers(target);
        }
        let mut ranked = self.peers.clone();
        sort_by_distance(&mut ranked, &keyspace_position(target));
        ranked.dedup();
        ranked.truncate(self.fanout);
        ranked
    }
}

/// Routing oracle answering from the node's own routing table.
pub struct TableRoutingOracle {
    self_id: NodeId,
    table: Arc<Mutex<RoutingTable>>,
    super_peers: Arc<dyn SuperPeerSource>,
    k: usize,
}

impl TableRoutingOracle {
    pub fn new(
        self_id: NodeId,
        table: Arc<Mutex<RoutingTable>>,
        super_peers: Arc<dyn SuperPeerSource>,
        k: usize,
    ) -> Self {
        Self {
            self_id,
            table,
            super_peers,
            k,
        }
    }
}

#[async_trait]
impl RoutingOracle for TableRoutingOracle {
    async fn closer_peers(&self, target: &[u8], exclude: &NodeId, count: usize) -> Vec<NodeId> {
        let rt = self.table.lock().await;
        rt.closest_to_key(target, count.saturating_add(1))
            .into_iter()
            .filter(|peer| peer != exclude && *peer != self.self_id)
            .take(count)
            .collect()
    }

    async fn closest_super_peers(&self, target: &[u8]) -> Result<Vec<NodeId>> {
        Ok(self.super_peers.closest_super_peers(target))
    }

    async fn closest_peers(&self, target: &[u8]) -> Result<Vec<NodeId>> {
        let rt = self.table.lock().await;
        Ok(rt.closest_to_key(target, self.k))
    }
}
