//! Node configuration.
//!
//! Every field has a default matching the protocol constants, so an empty
//! TOML document yields an interoperable node.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{CLOSER_PEER_COUNT, MAX_RECORD_AGE_SECS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Routing-table bucket size (`k`).
    pub bucket_size: usize,
    /// How many closer peers a responder attaches to its reply.
    pub closer_peer_count: usize,
    /// Freshness window for records authored by other peers.
    pub max_record_age_secs: u64,
    /// Lease for addresses learnt from provider announcements.
    pub provider_addr_ttl_secs: u64,
    /// Lease for addresses of peers that contacted us directly.
    pub peer_addr_ttl_secs: u64,
    /// Lifetime of an entry in the default provider table.
    pub provider_validity_secs: u64,
    /// Upper bound on waiting for a leaf pin result.
    pub pin_timeout_secs: u64,
    pub max_concurrent_pins: usize,
    /// Cap on fire-and-forget messages handled concurrently per node. A
    /// connection stops reading once the cap is reached.
    pub max_inflight_one_way: usize,
    /// Deadline for a transport request/reply round trip.
    pub request_timeout_secs: u64,
    pub max_frame_len: usize,
    pub max_record_size: usize,
    /// Capacity of the default in-memory record store.
    pub record_cache_entries: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            closer_peer_count: CLOSER_PEER_COUNT,
            max_record_age_secs: MAX_RECORD_AGE_SECS,
            provider_addr_ttl_secs: 10 * 60,
            peer_addr_ttl_secs: 30 * 60,
            provider_validity_secs: 24 * 60 * 60,
            pin_timeout_secs: 10 * 60,
            max_concurrent_pins: 4,
            max_inflight_one_way: 64,
            request_timeout_secs: 30,
            max_frame_len: 4 * 1024 * 1024,
            max_record_size: 1024 * 1024,
            record_cache_entries: 100_000,
        }
    }
}

impl DhtConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("invalid DHT configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn max_record_age(&self) -> Duration {
        Duration::from_secs(self.max_record_age_secs)
    }

    pub fn provider_addr_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_addr_ttl_secs)
    }

    pub fn peer_addr_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_addr_ttl_secs)
    }

    pub fn provider_validity(&self) -> Duration {
        Duration::from_secs(self.provider_validity_secs)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_secs(self.pin_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
