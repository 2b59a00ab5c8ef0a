//! Responder-side message handlers and the dispatch table selecting them.
//!
//! The [`Dispatcher`] is built once per node. Each handler receives the
//! node's [`NodeContext`], the sender's identity and the inbound message, and
//! returns the response to send back, or `None` when the message has no
//! response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::core::{Contact, NodeContext, NodeId};
use crate::error::HandlerError;
use crate::protocol::{ContentId, Message, MessageType, Record};
use crate::record::{check_freshness, clean_record, stamp_received, storage_key};
use crate::replication::AddFileHandler;

/// A handler for one or more message types.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError>;
}

/// Maps message types to their handlers.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    /// The built-in handler set.
    ///
    /// REMOVE_FILE answers like PING: it echoes the request and removes
    /// nothing. Deletion semantics for replicated files are not defined yet.
    pub fn standard() -> Self {
        let ping: Arc<dyn MessageHandler> = Arc::new(PingHandler);
        let mut dispatcher = Self::default();
        dispatcher.register(MessageType::GetValue, Arc::new(GetValueHandler));
        dispatcher.register(MessageType::PutValue, Arc::new(PutValueHandler));
        dispatcher.register(MessageType::FindNode, Arc::new(FindNodeHandler));
        dispatcher.register(MessageType::AddProvider, Arc::new(AddProviderHandler));
        dispatcher.register(MessageType::GetProviders, Arc::new(GetProvidersHandler));
        dispatcher.register(MessageType::Ping, ping.clone());
        dispatcher.register(MessageType::AddFile, Arc::new(AddFileHandler));
        dispatcher.register(MessageType::RemoveFile, ping);
        dispatcher
    }

    /// Register a handler, returning the one it replaces.
    pub fn register(
        &mut self,
        kind: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(kind, handler)
    }

    pub fn unregister(&mut self, kind: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.remove(&kind)
    }

    pub fn handler_for(&self, kind: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

/// Resolve closer peers for a response, warning about peers we cannot
/// give an address for. Addressless peers are still returned.
async fn closer_peer_infos(ctx: &NodeContext, key: &[u8], from: &NodeId) -> Vec<Contact> {
    let closer = ctx
        .routing
        .closer_peers(key, from, ctx.config.closer_peer_count)
        .await;
    let infos = ctx.peer_infos(&closer).await;
    for info in &infos {
        debug!(peer = %hex::encode(info.id), "returning closer peer");
        if !info.has_addrs() {
            warn!(
                local = %hex::encode(ctx.id),
                sending = %hex::encode(info.id),
                remote = %hex::encode(from),
                "no addresses on peer being sent"
            );
        }
    }
    infos
}

/// Accept the provider announcements in `announced` that `from` made about
/// itself, returning how many were recorded.
///
/// Entries naming a third party or carrying no address are skipped one by
/// one; they never fail the request.
pub(crate) async fn record_provider_announcements(
    ctx: &NodeContext,
    from: &NodeId,
    cid: &ContentId,
    announced: &[Contact],
) -> usize {
    let mut accepted = 0;
    for provider in announced {
        if provider.id != *from {
            debug!(
                provider = %hex::encode(provider.id),
                sender = %hex::encode(from),
                "ignoring provider announced on behalf of another peer"
            );
            continue;
        }
        if !provider.has_addrs() {
            debug!(provider = %hex::encode(from), "no valid addresses for provider, ignoring");
            continue;
        }

        info!(provider = %hex::encode(from), %cid, addrs = ?provider.addrs, "received provider");
        if provider.id != ctx.id {
            ctx.directory
                .add_addrs(&provider.id, &provider.addrs, ctx.config.provider_addr_ttl())
                .await;
        }
        ctx.providers.add_provider(cid, *from).await;
        accepted += 1;
    }
    accepted
}

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

/// GET_VALUE: return the local record for a key plus closer peers.
pub struct GetValueHandler;

impl GetValueHandler {
    /// Load a record, discarding it if it is stale.
    ///
    /// Records authored by the local node are returned without a freshness
    /// check. A stale record is deleted (best effort) and reported as absent.
    async fn check_local_datastore(
        ctx: &NodeContext,
        key: &[u8],
    ) -> Result<Option<Record>, HandlerError> {
        let dskey = storage_key(key);
        let Some(bytes) = ctx.store.get(&dskey).await.map_err(HandlerError::Storage)? else {
            return Ok(None);
        };

        let record = Record::from_bytes(&bytes).map_err(|source| {
            debug!(key = %dskey, "failed to decode DHT record from datastore");
            HandlerError::CorruptRecord {
                key: dskey.clone(),
                source,
            }
        })?;

        if record.author == Some(ctx.id) {
            return Ok(Some(record));
        }

        if let Err(reason) = check_freshness(&record, ctx.config.max_record_age(), Utc::now()) {
            info!(key = %dskey, %reason, "tossing bad record");
            if let Err(err) = ctx.store.delete(&dskey).await {
                error!(key = %dskey, "failed to delete bad record from datastore: {err:#}");
            }
            return Ok(None);
        }

        Ok(Some(record))
    }
}

#[async_trait]
impl MessageHandler for GetValueHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        debug!(peer = %hex::encode(from), key = %hex::encode(&message.key), "handling GET_VALUE");
        if message.key.is_empty() {
            return Err(HandlerError::MissingKey(MessageType::GetValue));
        }

        let mut resp = Message::new(message.kind, message.key.clone(), message.cluster_level);
        resp.record = Self::check_local_datastore(ctx, &message.key).await?;
        resp.closer_peers = closer_peer_infos(ctx, &message.key, from).await;
        Ok(Some(resp))
    }
}

/// PUT_VALUE: clean, validate, stamp and store a record.
pub struct PutValueHandler;

#[async_trait]
impl MessageHandler for PutValueHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        mut message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let Some(mut record) = message.record.take() else {
            info!(peer = %hex::encode(from), "got PUT_VALUE without a record");
            return Err(HandlerError::MissingRecord);
        };

        // Clean first so a sender cannot slip reserved fields past validation.
        clean_record(&mut record);
        if let Err(err) = ctx.validator.validate(&message.key, &record) {
            warn!(peer = %hex::encode(from), "bad DHT record in PUT: {err}");
            return Err(err.into());
        }

        stamp_received(&mut record, Utc::now());
        let data = record.to_bytes().map_err(HandlerError::Encode)?;
        let dskey = storage_key(&message.key);
        ctx.store
            .put(&dskey, data)
            .await
            .map_err(HandlerError::Storage)?;
        debug!(key = %dskey, "stored record");

        message.record = Some(record);
        Ok(Some(message))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// GET_PROVIDERS: known providers (including ourselves when we hold the
/// value) plus closer peers.
pub struct GetProvidersHandler;

#[async_trait]
impl MessageHandler for GetProvidersHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let cid = ContentId::parse(&message.key)?;
        debug!(peer = %hex::encode(from), %cid, "handling GET_PROVIDERS");

        let mut resp = Message::new(message.kind, message.key.clone(), message.cluster_level);

        let has = match ctx.store.has(&storage_key(cid.as_bytes())).await {
            Ok(has) => has,
            Err(err) => {
                debug!(%cid, "unexpected datastore error: {err:#}");
                false
            }
        };

        let mut providers = ctx.providers.providers(&cid).await;
        if has && !providers.contains(&ctx.id) {
            providers.push(ctx.id);
            debug!(%cid, "have the value, added self as provider");
        }

        if !providers.is_empty() {
            resp.provider_peers = ctx.peer_infos(&providers).await;
            debug!(%cid, count = providers.len(), "returning providers");
        }

        resp.closer_peers = closer_peer_infos(ctx, &message.key, from).await;
        Ok(Some(resp))
    }
}

/// ADD_PROVIDER: record the sender as a provider. No response.
pub struct AddProviderHandler;

#[async_trait]
impl MessageHandler for AddProviderHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let cid = ContentId::parse(&message.key)?;
        debug!(peer = %hex::encode(from), %cid, "handling ADD_PROVIDER");
        record_provider_announcements(ctx, from, &cid, &message.provider_peers).await;
        Ok(None)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// FIND_NODE: peers closer to a peer id, restricted to those with addresses.
pub struct FindNodeHandler;

#[async_trait]
impl MessageHandler for FindNodeHandler {
    async fn handle(
        &self,
        ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let mut resp = Message::new(message.kind, Vec::new(), message.cluster_level);

        // Looking for ourselves: answer with our own contact.
        let closest = if message.key.as_slice() == ctx.id.as_slice() {
            vec![ctx.id]
        } else {
            ctx.routing
                .closer_peers(&message.key, from, ctx.config.closer_peer_count)
                .await
        };

        if closest.is_empty() {
            info!(peer = %hex::encode(from), "FIND_NODE could not find anything");
            return Ok(Some(resp));
        }

        resp.closer_peers = ctx
            .peer_infos(&closest)
            .await
            .into_iter()
            .filter(|info| {
                let usable = info.has_addrs();
                if usable {
                    debug!(peer = %hex::encode(info.id), "FIND_NODE sending back peer");
                }
                usable
            })
            .collect();
        Ok(Some(resp))
    }
}

/// PING (and, for now, REMOVE_FILE): echo the request.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        _ctx: &NodeContext,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        debug!(peer = %hex::encode(from), kind = %message.kind, "responding to ping");
        Ok(Some(message))
    }
}
