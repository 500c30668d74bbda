#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use reload_ring::{
    AttachRequest, Destination, ErrorReply, LinkState, Message, NeighborView, NodeId,
    OverlayNetwork,
};

/// One call made against the network, in the order it was made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Send { message: Message, next_hop: NodeId },
    Error(ErrorReply),
    Attach(AttachRequest),
    Update { to: NodeId, view: Option<NeighborView> },
    Handover(NodeId),
    StoreReplicas(NodeId),
    EvaluateReplicas,
    Rejoin,
}

/// Network double that records every call instead of sending anything.
#[derive(Clone, Default)]
pub struct TestNetwork {
    calls: Arc<Mutex<Vec<Call>>>,
    live: Arc<StdMutex<HashSet<NodeId>>>,
    clients: Arc<StdMutex<Vec<NodeId>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    failed: Arc<Mutex<Vec<Call>>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live(&self, peer: NodeId, live: bool) {
        let mut links = self.live.lock().unwrap();
        if live {
            links.insert(peer);
        } else {
            links.remove(&peer);
        }
    }

    pub fn add_client(&self, peer: NodeId) {
        self.set_live(peer, true);
        self.clients.lock().unwrap().push(peer);
    }

    pub async fn set_failure(&self, peer: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        let calls = self.calls.lock().await;
        calls.clone()
    }

    /// Calls rejected by an injected failure, in order.
    pub async fn failed_calls(&self) -> Vec<Call> {
        self.failed.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Peers that received an Update, in order.
    pub async fn update_targets(&self) -> Vec<NodeId> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                Call::Update { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    /// Poll the recorded calls until `pred` holds or a second passes.
    pub async fn wait_for<F>(&self, pred: F) -> Vec<Call>
    where
        F: Fn(&[Call]) -> bool,
    {
        let poll = async {
            loop {
                let calls = self.calls().await;
                if pred(&calls) {
                    return calls;
                }
                sleep(Duration::from_millis(5)).await;
            }
        };
        match timeout(Duration::from_secs(1), poll).await {
            Ok(calls) => calls,
            Err(_) => panic!("timed out waiting for network calls: {:?}", self.calls().await),
        }
    }

    /// Give spawned action batches a chance to run.
    pub async fn settle(&self) -> Vec<Call> {
        sleep(Duration::from_millis(50)).await;
        self.calls().await
    }

    async fn record(&self, peer: Option<NodeId>, call: Call) -> Result<()> {
        if let Some(peer) = peer {
            if self.failures.lock().await.contains(&peer) {
                self.failed.lock().await.push(call);
                return Err(anyhow!("injected network failure"));
            }
        }
        self.calls.lock().await.push(call);
        Ok(())
    }
}

impl LinkState for TestNetwork {
    fn has_live_connection(&self, id: &NodeId) -> bool {
        self.live.lock().unwrap().contains(id)
    }

    fn connected_clients(&self) -> Vec<NodeId> {
        self.clients.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl OverlayNetwork for TestNetwork {
    async fn send(&self, message: Message, next_hop: NodeId) -> Result<()> {
        self.record(Some(next_hop), Call::Send { message, next_hop })
            .await
    }

    async fn send_error(&self, reply: ErrorReply) -> Result<()> {
        self.record(Some(reply.to), Call::Error(reply)).await
    }

    async fn attach(&self, request: AttachRequest) -> Result<()> {
        let peer = match request.target {
            Destination::Node(id) => Some(id),
            _ => None,
        };
        self.record(peer, Call::Attach(request)).await
    }

    async fn send_update(&self, to: NodeId, view: Option<NeighborView>) -> Result<()> {
        self.record(Some(to), Call::Update { to, view }).await
    }

    async fn handover_keys(&self, new_predecessor: NodeId) -> Result<()> {
        self.record(Some(new_predecessor), Call::Handover(new_predecessor))
            .await
    }

    async fn store_replicas(&self, to: NodeId) -> Result<()> {
        self.record(Some(to), Call::StoreReplicas(to)).await
    }

    async fn evaluate_replicas(&self) -> Result<()> {
        self.record(None, Call::EvaluateReplicas).await
    }

    async fn rejoin(&self) -> Result<()> {
        self.record(None, Call::Rejoin).await
    }
}

pub fn id(raw: u128) -> NodeId {
    NodeId::new(raw)
}

/// Spread `index` over the ring so small test populations do not cluster.
pub fn make_node_id(index: u32) -> NodeId {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&index.to_be_bytes());
    NodeId::from_bytes(bytes)
}
