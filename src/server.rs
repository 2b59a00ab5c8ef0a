use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::core::DhtNode;
use crate::framing::{read_frame, write_frame};
use crate::protocol::{Envelope, Reply};

/// Serve inbound envelopes on a single connection until the peer closes it.
///
/// Every envelope first records its sender in the node's routing table and
/// peer directory. Envelopes that expect a reply are handled inline and
/// answered with a [`Reply`]; fire-and-forget envelopes are handled on their
/// own task so the sender is released as soon as the frame is read. At most
/// `max_inflight_one_way` of those tasks run at once per node; beyond that the
/// connection waits for a permit before reading the next frame.
pub async fn handle_connection<S>(node: Arc<DhtNode>, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max_len = node.config().max_frame_len;
    while let Some(bytes) = read_frame(&mut stream, max_len).await? {
        let Envelope {
            from,
            message,
            expects_reply,
        } = serde_json::from_slice(&bytes).context("malformed envelope")?;
        let sender = from.id;
        node.observe_contact(from).await;

        if !expects_reply {
            let permit = node
                .one_way_permits()
                .clone()
                .acquire_owned()
                .await
                .context("one-way permits closed")?;
            let node = node.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let kind = message.kind;
                match node.handle_message(&sender, message).await {
                    Ok(Some(_)) => {
                        debug!(peer = %hex::encode(sender), %kind, "dropping response to one-way message")
                    }
                    Ok(None) => {}
                    Err(err) => warn!(peer = %hex::encode(sender), %kind, "one-way message failed: {err}"),
                }
            });
            continue;
        }

        let kind = message.kind;
        let reply = match node.handle_message(&sender, message).await {
            Ok(message) => Reply {
                message,
                error: None,
            },
            Err(err) => {
                debug!(peer = %hex::encode(sender), %kind, "rejecting request: {err}");
                Reply {
                    message: None,
                    error: Some(err.to_string()),
                }
            }
        };
        let reply_bytes = serde_json::to_vec(&reply)?;
        write_frame(&mut stream, &reply_bytes, max_len).await?;
    }
    Ok(())
}

/// Accept connections on `listener` forever, serving each on its own task.
pub async fn serve(node: Arc<DhtNode>, listener: TcpListener) -> Result<()> {
    info!(addr = ?listener.local_addr()?, "accepting DHT connections");
    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream).await {
                debug!(%remote, "connection closed with error: {err:?}");
            }
        });
    }
}
