#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{make_node_id, NetworkRegistry, TestNode};
use tiered_dht::{
    Contact, DhtConfig, HandlerError, Message, MessageHandler, MessageType, NodeContext, NodeId,
};

#[tokio::test]
async fn find_node_for_self_returns_only_self() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::new(registry.clone(), 1).await;
    for index in 2..6 {
        let peer = TestNode::new(registry.clone(), index).await;
        a.learn(&peer).await;
    }

    let resp = a
        .handle(&make_node_id(2), Message::new(MessageType::FindNode, a.id().to_vec(), 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.closer_peers, vec![a.contact()]);
    assert!(resp.key.is_empty());
}

#[tokio::test]
async fn find_node_drops_addressless_peers() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::new(registry.clone(), 1).await;
    let b = TestNode::new(registry.clone(), 2).await;
    let c = TestNode::new(registry, 3).await;
    a.learn(&c).await;
    a.node
        .observe_contact(Contact::new(make_node_id(40), Vec::new()))
        .await;

    let target = make_node_id(99);
    let resp = a
        .handle(&b.id(), Message::new(MessageType::FindNode, target.to_vec(), 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.closer_peers, vec![c.contact()]);
}

#[tokio::test]
async fn find_node_with_empty_table_is_a_valid_empty_answer() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::new(registry, 1).await;

    let resp = a
        .handle(&make_node_id(2), Message::new(MessageType::FindNode, make_node_id(3).to_vec(), 7))
        .await
        .expect("nothing found is not an error")
        .expect("FIND_NODE always answers");
    assert!(resp.closer_peers.is_empty());
    assert_eq!(resp.cluster_level, 7);
}

#[tokio::test]
async fn ping_and_remove_file_echo_the_request() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::new(registry, 1).await;

    let ping = Message::new(MessageType::Ping, b"hi".to_vec(), 3);
    assert_eq!(a.handle(&make_node_id(2), ping.clone()).await.unwrap(), Some(ping));

    let remove = Message::new(MessageType::RemoveFile, b"cidR".to_vec(), 0);
    assert_eq!(
        a.handle(&make_node_id(2), remove.clone()).await.unwrap(),
        Some(remove)
    );
}

struct Refuse;

#[async_trait]
impl MessageHandler for Refuse {
    async fn handle(
        &self,
        _ctx: &NodeContext,
        _from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, HandlerError> {
        Err(HandlerError::Unhandled(message.kind))
    }
}

#[tokio::test]
async fn registered_handlers_replace_the_defaults() {
    let registry = Arc::new(NetworkRegistry::default());
    let a = TestNode::with(registry, 1, DhtConfig::default(), |builder| {
        builder.handler(MessageType::RemoveFile, Arc::new(Refuse))
    })
    .await;

    let err = a
        .handle(&make_node_id(2), Message::new(MessageType::RemoveFile, b"cidR".to_vec(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Unhandled(MessageType::RemoveFile)));
    assert!(a
        .handle(&make_node_id(2), Message::new(MessageType::Ping, Vec::new(), 0))
        .await
        .is_ok());
}
