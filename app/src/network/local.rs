use super::{Error, Network, PeerId, RequestHandler};
use async_trait::async_trait;
use parking_lot::RwLock;
use protocol::{Envelope, PublicKey};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::*;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure injected on requests addressed to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Requests fail right away
    Unreachable,
    /// Requests never complete
    Timeout,
    /// Requests are answered with undecodable bytes
    Garbage,
}

struct NodeEntry {
    topics: HashSet<String>,
    handlers: HashMap<String, RequestHandler>,
    events_tx: broadcast::Sender<Envelope>,
    fault: Option<Fault>,
}

/// In-process hub connecting any number of nodes.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<RwLock<BTreeMap<PeerId, NodeEntry>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, id: impl Into<String>) -> LocalNode {
        let peer_id = PeerId::new(id);
        let (events_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.nodes.write().insert(
            peer_id.clone(),
            NodeEntry {
                topics: HashSet::new(),
                handlers: HashMap::new(),
                events_tx,
                fault: None,
            },
        );
        LocalNode {
            peer_id,
            hub: self.clone(),
        }
    }

    pub fn set_fault(&self, peer_id: &PeerId, fault: Option<Fault>) {
        if let Some(node) = self.nodes.write().get_mut(peer_id) {
            node.fault = fault;
        }
    }
}

#[derive(Clone)]
pub struct LocalNode {
    peer_id: PeerId,
    hub: LocalNetwork,
}

impl LocalNode {
    /// Envelopes published by other nodes on topics this node subscribed to.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<Envelope>> {
        self.hub
            .nodes
            .read()
            .get(&self.peer_id)
            .map(|node| node.events_tx.subscribe())
    }

    fn update_topics(&self, f: impl FnOnce(&mut HashSet<String>)) -> Result<(), Error> {
        let mut nodes = self.hub.nodes.write();
        let node = nodes
            .get_mut(&self.peer_id)
            .ok_or_else(|| Error::PeerUnreachable(self.peer_id.clone()))?;
        f(&mut node.topics);
        Ok(())
    }
}

#[async_trait]
impl Network for LocalNode {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn subscribe(&self, public_key: &PublicKey) -> Result<(), Error> {
        let topic = public_key.topic();
        debug!(peer = %self.peer_id, %topic, "Subscribing");
        self.update_topics(|topics| {
            topics.insert(topic);
        })
    }

    async fn unsubscribe(&self, public_key: &PublicKey) -> Result<(), Error> {
        let topic = public_key.topic();
        self.update_topics(|topics| {
            topics.remove(&topic);
        })
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<(), Error> {
        let topic = envelope.msg_id.public_key.topic();
        let nodes = self.hub.nodes.read();
        for (peer_id, node) in nodes.iter() {
            if *peer_id == self.peer_id || !node.topics.contains(&topic) {
                continue;
            }
            // no receiver means nobody listens on that node, nothing to do
            let _ = node.events_tx.send(envelope.clone());
        }
        Ok(())
    }

    fn peers(&self, public_key: &PublicKey) -> Vec<PeerId> {
        let topic = public_key.topic();
        self.hub
            .nodes
            .read()
            .iter()
            .filter(|(peer_id, node)| **peer_id != self.peer_id && node.topics.contains(&topic))
            .map(|(peer_id, _)| peer_id.clone())
            .collect()
    }

    fn register_handler(&self, protocol: &str, handler: RequestHandler) {
        if let Some(node) = self.hub.nodes.write().get_mut(&self.peer_id) {
            node.handlers.insert(protocol.to_string(), handler);
        }
    }

    async fn request(
        &self,
        peer: &PeerId,
        protocol: &str,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let (handler, fault) = {
            let nodes = self.hub.nodes.read();
            let node = nodes
                .get(peer)
                .ok_or_else(|| Error::PeerUnreachable(peer.clone()))?;
            (node.handlers.get(protocol).cloned(), node.fault)
        };

        match fault {
            Some(Fault::Unreachable) => return Err(Error::PeerUnreachable(peer.clone())),
            Some(Fault::Timeout) => {
                // the caller's deadline is what ends this request
                futures::future::pending::<()>().await;
            }
            Some(Fault::Garbage) => return Ok(vec![0xc1]),
            None => {}
        }

        let handler = handler.ok_or_else(|| Error::NoHandler {
            peer: peer.clone(),
            protocol: protocol.to_string(),
        })?;
        trace!(from = %self.peer_id, to = %peer, protocol, "Routing request");
        Ok(handler(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Identifier, MsgType, RunnerRole};
    use std::time::Duration;

    #[tokio::test]
    async fn peers_are_topic_subscribers_except_self() {
        let network = LocalNetwork::new();
        let a = network.add_node("a");
        let b = network.add_node("b");
        let c = network.add_node("c");
        let pk = PublicKey::new(vec![1u8; 48]);

        for node in [&a, &b, &c] {
            node.subscribe(&pk).await.unwrap();
        }
        assert_eq!(a.peers(&pk), vec![PeerId::new("b"), PeerId::new("c")]);

        c.unsubscribe(&pk).await.unwrap();
        assert_eq!(a.peers(&pk), vec![PeerId::new("b")]);
        assert!(a.peers(&PublicKey::new(vec![2u8; 48])).is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers_only() {
        let network = LocalNetwork::new();
        let a = network.add_node("a");
        let b = network.add_node("b");
        let c = network.add_node("c");
        let pk = PublicKey::new(vec![1u8; 48]);
        a.subscribe(&pk).await.unwrap();
        b.subscribe(&pk).await.unwrap();

        let mut b_events = b.subscribe_events().unwrap();
        let mut c_events = c.subscribe_events().unwrap();
        let envelope = Envelope {
            msg_type: MsgType::Consensus,
            msg_id: Identifier::new(pk, RunnerRole::Attester),
            data: vec![1, 2, 3],
        };
        a.broadcast(envelope.clone()).await.unwrap();

        assert_eq!(b_events.recv().await.unwrap(), envelope);
        assert!(c_events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn faults_shape_request_outcomes() {
        let network = LocalNetwork::new();
        let a = network.add_node("a");
        let b = network.add_node("b");
        b.register_handler("/echo", Arc::new(|req: &[u8]| req.to_vec()));

        let peer = PeerId::new("b");
        assert_eq!(a.request(&peer, "/echo", vec![7]).await.unwrap(), vec![7]);
        assert!(matches!(
            a.request(&peer, "/missing", vec![]).await,
            Err(Error::NoHandler { .. })
        ));

        network.set_fault(&peer, Some(Fault::Unreachable));
        assert!(matches!(
            a.request(&peer, "/echo", vec![7]).await,
            Err(Error::PeerUnreachable(_))
        ));

        network.set_fault(&peer, Some(Fault::Garbage));
        assert_eq!(a.request(&peer, "/echo", vec![7]).await.unwrap(), vec![0xc1]);

        network.set_fault(&peer, Some(Fault::Timeout));
        let pending =
            tokio::time::timeout(Duration::from_secs(1), a.request(&peer, "/echo", vec![7])).await;
        assert!(pending.is_err());
    }
}
