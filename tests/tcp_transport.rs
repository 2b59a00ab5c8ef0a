use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

use tiered_dht::{
    derive_node_id, serve, Contact, ContentId, DhtConfig, DhtNode, LocalPinSet, MemoryPeerDirectory,
    Message, MessageType, PeerDirectory, PinWorker, ProviderTable, TcpTransport, Transport,
};

struct TcpNode {
    node: Arc<DhtNode>,
    transport: Arc<TcpTransport>,
    directory: Arc<MemoryPeerDirectory>,
    pinned: Arc<LocalPinSet>,
}

async fn spawn_node(seed: &[u8]) -> TcpNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let id = derive_node_id(seed);
    let contact = Contact::new(id, vec![listener.local_addr().unwrap().to_string()]);

    let config = DhtConfig {
        request_timeout_secs: 5,
        pin_timeout_secs: 5,
        ..DhtConfig::default()
    };
    let directory = Arc::new(MemoryPeerDirectory::default());
    let transport = Arc::new(TcpTransport::new(contact.clone(), directory.clone(), &config));
    let pinned = Arc::new(LocalPinSet::default());
    let node = Arc::new(
        DhtNode::builder(contact, transport.clone())
            .config(config)
            .directory(directory.clone())
            .pins(Arc::new(PinWorker::new(pinned.clone(), 2)))
            .build(),
    );
    tokio::spawn(serve(node.clone(), listener));

    TcpNode {
        node,
        transport,
        directory,
        pinned,
    }
}

async fn introduce(from: &TcpNode, to: &TcpNode) {
    from.directory
        .add_addrs(&to.node.id, &to.node.self_contact.addrs, Duration::from_secs(60))
        .await;
}

#[tokio::test]
async fn request_round_trips_over_tcp() {
    let a = spawn_node(b"node a").await;
    let b = spawn_node(b"node b").await;
    introduce(&a, &b).await;

    let ping = Message::new(MessageType::Ping, b"hello".to_vec(), 0);
    let reply = a.transport.request(&b.node.id, ping.clone()).await.unwrap();
    assert_eq!(reply, ping);

    // The server records who talked to it, addresses included.
    assert_eq!(b.node.routing_table_len().await, 1);
    assert_eq!(
        b.directory.resolve(&a.node.id).await,
        a.node.self_contact.addrs
    );
}

#[tokio::test]
async fn handler_errors_come_back_as_request_errors() {
    let a = spawn_node(b"node a").await;
    let b = spawn_node(b"node b").await;
    introduce(&a, &b).await;

    let err = a
        .transport
        .request(&b.node.id, Message::new(MessageType::GetValue, Vec::new(), 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("carried no key"), "{err:#}");

    // ADD_PROVIDER has no response, which a request reports as an error.
    let announce = Message::new(MessageType::AddProvider, b"cid".to_vec(), 0)
        .with_provider(a.node.self_contact.clone());
    assert!(a.transport.request(&b.node.id, announce).await.is_err());
}

#[tokio::test]
async fn leaf_pins_over_tcp() {
    let a = spawn_node(b"node a").await;
    let b = spawn_node(b"node b").await;
    introduce(&a, &b).await;

    let add = Message::new(MessageType::AddFile, b"cidTcp".to_vec(), 50)
        .with_provider(a.node.self_contact.clone());
    let reply = a.transport.request(&b.node.id, add).await.unwrap();
    assert_eq!(reply.cluster_level, 88);
    assert!(b.pinned.is_pinned(b"cidTcp").await);
}

#[tokio::test]
async fn one_way_send_is_handled_in_the_background() {
    let a = spawn_node(b"node a").await;
    let b = spawn_node(b"node b").await;
    introduce(&a, &b).await;

    let announce = Message::new(MessageType::AddProvider, b"cidBg".to_vec(), 0)
        .with_provider(a.node.self_contact.clone());
    a.transport.send(&b.node.id, announce).await.unwrap();

    let cid = ContentId::parse(b"cidBg").unwrap();
    let mut providers = Vec::new();
    for _ in 0..50 {
        providers = b.node.context().providers.providers(&cid).await;
        if !providers.is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(providers, vec![a.node.id]);
}

#[tokio::test]
async fn unknown_peers_cannot_be_reached() {
    let a = spawn_node(b"node a").await;
    let stranger = derive_node_id(b"stranger");
    let err = a
        .transport
        .request(&stranger, Message::new(MessageType::Ping, Vec::new(), 0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no known addresses"));
}
