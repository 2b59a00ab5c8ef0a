//! ADD_FILE: tree-shaped replication of a content key down to pinning leaves.
//!
//! The `cluster_level` field of an ADD_FILE message selects the phase the
//! receiving node plays (see [`ReplicationLevel`]):
//!
//! 1. **Broadcast** (`< 10`): fan out to the super-peer set, concurrently, and
//!    wait for every branch. A super peer that is the local node relays
//!    directly instead of going through the transport.
//! 2. **Relay** (`10 ..= 19`): ask leaf candidates to pin, one at a time, until
//!    the requested number of them confirm.
//! 3. **Leaf** (`>= 20`): pin locally and answer with [`PinAck`].
//!
//! Only the leaf phase answers its caller. Branch and transport failures are
//! logged and skipped; they never fail the request.

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::{NodeContext, NodeId};
use crate::error::HandlerError;
use crate::handlers::{record_provider_announcements, MessageHandler};
use crate::pin::PIN_OK;
use crate::protocol::{ContentId, Message, PinAck, ReplicationLevel};

/// Handler for ADD_FILE messages.
pub struct AddFileHandler;

#[async_trait]
impl MessageHandler for AddFileHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let cid = ContentId::parse(&message.key)?;
        debug!(peer = %hex::encode(from), %cid, level = message.cluster_level, "handling ADD_FILE");

        // An ADD_FILE doubles as a provider announcement by its sender.
        record_provider_announcements(ctx, from, &cid, &message.provider_peers).await;

        match ReplicationLevel::decode(message.cluster_level) {
            ReplicationLevel::Broadcast { hint } => {
                broadcast_to_super_peers(ctx, &cid, message, hint).await?;
                Ok(None)
            }
            ReplicationLevel::Relay { remaining } => {
                relay_to_leaves(ctx, &cid, message, remaining).await?;
                Ok(None)
            }
            ReplicationLevel::Leaf => Ok(Some(pin_locally(ctx, &cid, message).await)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 1: Broadcast
// ─────────────────────────────────────────────────────────────────────────────

/// Hand `message` to every super peer responsible for `cid`.
///
/// The outgoing copy carries `hint + 10`, so each super peer relays to `hint`
/// leaves. Returns once every branch has finished; the number of branches
/// that failed is returned for logging.
pub async fn broadcast_to_super_peers(
    ctx: &NodeContext,
    cid: &ContentId,
    mut message: Message,
    hint: i32,
) -> Result<usize, HandlerError> {
    let super_peers = ctx
        .routing
        .closest_super_peers(cid.as_bytes())
        .await
        .map_err(HandlerError::Routing)?;

    message.cluster_level = ReplicationLevel::Relay { remaining: hint }.encode();
    debug!(%cid, count = super_peers.len(), level = message.cluster_level, "broadcasting to super peers");

    let branches = super_peers.iter().map(|peer| {
        let message = message.clone();
        async move {
            if *peer == ctx.id {
                relay_to_leaves(ctx, cid, message, hint)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            } else {
                ctx.transport.send(peer, message).await
            }
        }
    });
    let results = join_all(branches).await;

    let mut failed = 0;
    for (peer, result) in super_peers.iter().zip(results) {
        if let Err(err) = result {
            failed += 1;
            warn!(peer = %hex::encode(peer), %cid, "super peer branch failed: {err:#}");
        }
    }
    Ok(failed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 2: Relay
// ─────────────────────────────────────────────────────────────────────────────

/// Tally of one relay run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Confirmations required before the relay stops.
    pub target: usize,
    pub confirmed: usize,
    /// Leaves that answered with anything other than a confirmation.
    pub failed: usize,
    /// Leaves the transport could not reach.
    pub unreachable: usize,
}

impl RelayOutcome {
    /// A requested count below one still asks for a single confirmation.
    fn new(requested: i32) -> Self {
        Self {
            target: usize::try_from(requested).unwrap_or(0).max(1),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.confirmed >= self.target
    }

    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.confirmed)
    }
}

/// Ask leaf candidates for `cid`, in order, to pin until `remaining` confirm.
///
/// The peer named by the first provider entry is skipped. Running out of
/// candidates ends the relay without reporting an error.
pub async fn relay_to_leaves(
    ctx: &NodeContext,
    cid: &ContentId,
    mut message: Message,
    remaining: i32,
) -> Result<RelayOutcome, HandlerError> {
    let candidates = ctx
        .routing
        .closest_peers(cid.as_bytes())
        .await
        .map_err(HandlerError::Routing)?;
    let provider = message.provider_peers.first().map(|contact| contact.id);
    message.cluster_level = ReplicationLevel::Leaf.encode();

    let mut outcome = RelayOutcome::new(remaining);
    for leaf in candidates.iter().filter(|peer| Some(**peer) != provider) {
        match ctx.transport.request(leaf, message.clone()).await {
            Ok(reply) => match PinAck::decode(reply.cluster_level) {
                Some(PinAck::Confirmed) => {
                    outcome.confirmed += 1;
                    debug!(leaf = %hex::encode(leaf), %cid, remaining = outcome.remaining(), "leaf confirmed pin");
                    if outcome.is_complete() {
                        break;
                    }
                }
                _ => {
                    outcome.failed += 1;
                    debug!(leaf = %hex::encode(leaf), %cid, level = reply.cluster_level, "leaf did not confirm pin");
                }
            },
            Err(err) => {
                outcome.unreachable += 1;
                debug!(leaf = %hex::encode(leaf), %cid, "relay request failed: {err:#}");
            }
        }
    }

    if outcome.is_complete() {
        info!(%cid, confirmed = outcome.confirmed, "replication target reached");
    } else {
        warn!(
            %cid,
            target = outcome.target,
            confirmed = outcome.confirmed,
            failed = outcome.failed,
            unreachable = outcome.unreachable,
            "ran out of leaf candidates before reaching replication target"
        );
    }
    Ok(outcome)
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 3: Leaf
// ─────────────────────────────────────────────────────────────────────────────

/// Pin `cid` and turn `message` into the acknowledgement.
///
/// The wait is bounded by the configured pin timeout; a timeout or a pin
/// executor that drops the result counts as a failed pin.
async fn pin_locally(ctx: &NodeContext, cid: &ContentId, mut message: Message) -> Message {
    let result = ctx.pins.submit(cid.as_bytes().to_vec());
    let ack = match timeout(ctx.config.pin_timeout(), result).await {
        Ok(Ok(status)) if status == PIN_OK => PinAck::Confirmed,
        Ok(Ok(status)) => {
            info!(%cid, %status, "pin failed");
            PinAck::Failed
        }
        Ok(Err(_)) => {
            warn!(%cid, "pin executor dropped the result");
            PinAck::Failed
        }
        Err(_) => {
            warn!(%cid, timeout = ?ctx.config.pin_timeout(), "pin timed out");
            PinAck::Failed
        }
    };
    if ack == PinAck::Confirmed {
        info!(%cid, "pinned");
    }
    message.cluster_level = ack.encode();
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_target_is_at_least_one() {
        assert_eq!(RelayOutcome::new(0).target, 1);
        assert_eq!(RelayOutcome::new(-3).target, 1);
        assert_eq!(RelayOutcome::new(4).target, 4);
    }

    #[test]
    fn outcome_counts_down_to_completion() {
        let mut outcome = RelayOutcome::new(2);
        assert_eq!(outcome.remaining(), 2);
        outcome.confirmed = 1;
        assert!(!outcome.is_complete());
        outcome.confirmed = 2;
        assert!(outcome.is_complete());
        assert_eq!(outcome.remaining(), 0);
    }
}
