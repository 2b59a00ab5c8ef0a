#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{sleep, Duration};

use tiered_dht::{
    Contact, DhtConfig, DhtNode, DhtNodeBuilder, MemoryRecordStore, Message, NodeId, PinExecutor,
    Transport,
};

/// In-process transport delivering messages straight to registered nodes.
///
/// Both `send` and `request` run the remote handler to completion before
/// returning, so a test observes the full effect of a call once it returns.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_id: NodeId,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    sends: Arc<Mutex<Vec<(NodeId, Message)>>>,
    requests: Arc<Mutex<Vec<(NodeId, Message)>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_id: NodeId) -> Self {
        Self {
            registry,
            self_id,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            sends: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        let mut latencies = self.latencies.lock().await;
        latencies.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn send_calls(&self) -> Vec<(NodeId, Message)> {
        let sends = self.sends.lock().await;
        sends.clone()
    }

    pub async fn request_calls(&self) -> Vec<(NodeId, Message)> {
        let requests = self.requests.lock().await;
        requests.clone()
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = {
            let latencies = self.latencies.lock().await;
            latencies.get(node).copied()
        };
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for TestNetwork {
    async fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        if self.should_fail(to).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(to).await;
        {
            let mut sends = self.sends.lock().await;
            sends.push((*to, message.clone()));
        }
        let peer = self
            .registry
            .get(to)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        // One-way: the handler outcome is not reported back to the sender.
        let _ = peer.handle_message(&self.self_id, message).await;
        Ok(())
    }

    async fn request(&self, to: &NodeId, message: Message) -> Result<Message> {
        if self.should_fail(to).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(to).await;
        {
            let mut requests = self.requests.lock().await;
            requests.push((*to, message.clone()));
        }
        let peer = self
            .registry
            .get(to)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        peer.handle_message(&self.self_id, message)
            .await?
            .ok_or_else(|| anyhow!("peer sent no response"))
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Arc<DhtNode>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: Arc<DhtNode>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.id, node);
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<DhtNode>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

/// What a [`ScriptedPins`] executor does with each submission.
#[derive(Clone, Debug)]
pub enum PinScript {
    /// Report this status.
    Reply(String),
    /// Never report; the result channel stays open.
    Hang,
    /// Drop the result channel without reporting.
    Drop,
}

/// Pin executor answering from a script and recording every submitted key.
pub struct ScriptedPins {
    script: std::sync::Mutex<PinScript>,
    submitted: std::sync::Mutex<Vec<Vec<u8>>>,
    held: std::sync::Mutex<Vec<oneshot::Sender<String>>>,
}

impl ScriptedPins {
    pub fn new(script: PinScript) -> Self {
        Self {
            script: std::sync::Mutex::new(script),
            submitted: std::sync::Mutex::new(Vec::new()),
            held: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn ok() -> Self {
        Self::new(PinScript::Reply("OK".to_string()))
    }

    pub fn set_script(&self, script: PinScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().unwrap().clone()
    }
}

impl PinExecutor for ScriptedPins {
    fn submit(&self, key: Vec<u8>) -> oneshot::Receiver<String> {
        self.submitted.lock().unwrap().push(key);
        let (tx, rx) = oneshot::channel();
        match self.script.lock().unwrap().clone() {
            PinScript::Reply(status) => {
                let _ = tx.send(status);
            }
            PinScript::Hang => self.held.lock().unwrap().push(tx),
            PinScript::Drop => drop(tx),
        }
        rx
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode>,
    pub network: TestNetwork,
    pub store: Arc<MemoryRecordStore>,
    pub pins: Arc<ScriptedPins>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32) -> Self {
        Self::with(registry, index, DhtConfig::default(), |builder| builder).await
    }

    /// Build a node with `customize` applied to the builder after the test
    /// collaborators are installed.
    pub async fn with(
        registry: Arc<NetworkRegistry>,
        index: u32,
        config: DhtConfig,
        customize: impl FnOnce(DhtNodeBuilder) -> DhtNodeBuilder,
    ) -> Self {
        let contact = make_contact(index);
        let network = TestNetwork::new(registry.clone(), contact.id);
        let store = Arc::new(MemoryRecordStore::new(config.record_cache_entries));
        let pins = Arc::new(ScriptedPins::ok());
        let builder = DhtNode::builder(contact, Arc::new(network.clone()))
            .config(config)
            .store(store.clone())
            .pins(pins.clone());
        let node = Arc::new(customize(builder).build());
        registry.register(node.clone()).await;
        Self {
            node,
            network,
            store,
            pins,
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn contact(&self) -> Contact {
        self.node.self_contact.clone()
    }

    /// Make `other` known to this node, with its addresses.
    pub async fn learn(&self, other: &TestNode) {
        self.node.observe_contact(other.contact()).await;
    }

    pub async fn handle(
        &self,
        from: &NodeId,
        message: Message,
    ) -> Result<Option<Message>, tiered_dht::HandlerError> {
        self.node.handle_message(from, message).await
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_contact(index: u32) -> Contact {
    Contact::new(make_node_id(index), vec![format!("node-{index}:4100")])
}
