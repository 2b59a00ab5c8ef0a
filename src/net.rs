//! Network implementation over plain TCP.
//!
//! This module provides [`TcpTransport`], the [`Transport`] used by the
//! binary. Every call opens a fresh connection to one of the peer's known
//! addresses and exchanges length-prefixed JSON frames (see
//! [`crate::framing`]):
//!
//! - `send` writes one [`Envelope`] with `expects_reply = false` and closes.
//! - `request` writes one [`Envelope`] and waits for the [`Reply`].
//!
//! Addresses are resolved through the node's [`PeerDirectory`].

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::config::DhtConfig;
use crate::core::{Contact, NodeId, PeerDirectory, Transport};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Envelope, Message, MessageType, Reply};

/// TCP transport carrying JSON envelopes.
pub struct TcpTransport {
    /// Contact info for the local node (included in every envelope).
    self_contact: Contact,
    directory: Arc<dyn PeerDirectory>,
    request_timeout: Duration,
    /// Leaf pins can take up to the pin timeout before the reply is written.
    pin_timeout: Duration,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new(self_contact: Contact, directory: Arc<dyn PeerDirectory>, config: &DhtConfig) -> Self {
        Self {
            self_contact,
            directory,
            request_timeout: config.request_timeout(),
            pin_timeout: config.pin_timeout(),
            max_frame_len: config.max_frame_len,
        }
    }

    /// Deadline for a full request/reply round trip of `kind`.
    fn deadline_for(&self, kind: MessageType) -> Duration {
        match kind {
            MessageType::AddFile => self.request_timeout + self.pin_timeout,
            _ => self.request_timeout,
        }
    }

    /// Connect to the first reachable address of `peer`.
    async fn connect(&self, peer: &NodeId) -> Result<TcpStream> {
        let addrs = self.directory.resolve(peer).await;
        if addrs.is_empty() {
            bail!("no known addresses for peer {}", hex::encode(peer));
        }

        let mut last_err = None;
        for addr in &addrs {
            match timeout(self.request_timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => {
                    debug!(peer = %hex::encode(peer), %addr, "connect failed: {err:?}");
                    last_err = Some(anyhow::Error::from(err));
                }
                Err(_) => {
                    debug!(peer = %hex::encode(peer), %addr, "connect timed out");
                    last_err = Some(anyhow!("connect to {addr} timed out"));
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("no usable address"))
            .context(format!("failed to reach peer {}", hex::encode(peer))))
    }

    async fn write_envelope(
        &self,
        stream: &mut TcpStream,
        message: Message,
        expects_reply: bool,
    ) -> Result<()> {
        let envelope = Envelope {
            from: self.self_contact.clone(),
            message,
            expects_reply,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        write_frame(stream, &bytes, self.max_frame_len).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        let mut stream = self.connect(to).await?;
        timeout(self.request_timeout, async {
            self.write_envelope(&mut stream, message, false).await?;
            stream.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("send timed out")??;
        Ok(())
    }

    async fn request(&self, to: &NodeId, message: Message) -> Result<Message> {
        let kind = message.kind;
        let mut stream = self.connect(to).await?;
        let exchange = async {
            self.write_envelope(&mut stream, message, true).await?;
            let bytes = read_frame(&mut stream, self.max_frame_len)
                .await?
                .context("peer closed the connection without replying")?;
            let reply: Reply = serde_json::from_slice(&bytes)?;
            Ok::<_, anyhow::Error>(reply)
        };
        let reply = timeout(self.deadline_for(kind), exchange)
            .await
            .with_context(|| format!("{kind} request to {} timed out", hex::encode(to)))??;

        if let Some(error) = reply.error {
            bail!("peer rejected {kind}: {error}");
        }
        reply
            .message
            .ok_or_else(|| anyhow!("peer sent no response to {kind}"))
    }
}
