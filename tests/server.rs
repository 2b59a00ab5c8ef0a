#[path = "common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use common::{make_contact, NetworkRegistry, TestNode};
use tiered_dht::framing::write_frame;
use tiered_dht::protocol::Envelope;
use tiered_dht::{
    handle_connection, DhtConfig, HandlerError, Message, MessageHandler, MessageType, NodeContext,
    NodeId,
};

/// Ping handler that takes a while and records how many copies overlap.
#[derive(Default)]
struct SlowPing {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SlowPing {
    async fn handle(
        &self,
        _ctx: &NodeContext,
        _from: &NodeId,
        _message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_secs(1)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

async fn run_one_way_burst(max_inflight_one_way: usize, burst: usize) -> Arc<SlowPing> {
    let registry = Arc::new(NetworkRegistry::default());
    let handler = Arc::new(SlowPing::default());
    let config = DhtConfig {
        max_inflight_one_way,
        ..DhtConfig::default()
    };
    let dispatch = handler.clone();
    let node = TestNode::with(registry, 1, config, |builder| {
        builder.handler(MessageType::Ping, dispatch)
    })
    .await;

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    for _ in 0..burst {
        let envelope = Envelope {
            from: make_contact(2),
            message: Message::new(MessageType::Ping, b"hi".to_vec(), 0),
            expects_reply: false,
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        write_frame(&mut client, &bytes, 1024 * 1024).await.unwrap();
    }
    drop(client);

    handle_connection(node.node.clone(), server).await.unwrap();
    for _ in 0..100 {
        if handler.completed.load(Ordering::SeqCst) == burst {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(handler.completed.load(Ordering::SeqCst), burst);
    handler
}

#[tokio::test(start_paused = true)]
async fn one_way_handlers_respect_the_inflight_cap() {
    let handler = run_one_way_burst(1, 3).await;
    assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn one_way_handlers_overlap_up_to_the_cap() {
    let handler = run_one_way_burst(2, 4).await;
    assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
}
