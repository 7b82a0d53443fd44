//! In-process cluster: every node gets a memory store, an endpoint on a shared
//! local network, and actors for the same set of validators.

use crate::config::NodeConfig;
use crate::network::{LocalNetwork, LocalNode, Network};
use crate::runner::local::{share, LocalConsensus, LocalSigner, RecordingBeacon};
use crate::runner::{BaseRunner, DutyRunners, Runner};
use crate::store::{DecidedStore, MemoryStore};
use crate::sync::{decided_pipeline, register_sync_handlers, CommitteeRegistry, History};
use crate::validator::{Options, Validator};
use eyre::Result;
use protocol::{
    quorum, ConsensusMsgType, Duty, Identifier, OperatorId, PublicKey, RunnerRole, Signature,
    SignedConsensusMessage,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::*;

pub struct DevnetNode {
    pub operator_id: OperatorId,
    pub endpoint: LocalNode,
    pub store: Arc<MemoryStore>,
    pub history: Arc<History>,
    pub validators: HashMap<PublicKey, Arc<Validator>>,
}

pub struct Devnet {
    pub network: LocalNetwork,
    pub registry: Arc<CommitteeRegistry>,
    pub validator_keys: Vec<PublicKey>,
    pub nodes: Vec<DevnetNode>,
}

/// Decided message at `height`, signed by a quorum of `operators`.
pub fn decided_message(
    identifier: &Identifier,
    height: u64,
    operators: &[OperatorId],
) -> SignedConsensusMessage {
    SignedConsensusMessage {
        msg_type: ConsensusMsgType::Commit,
        identifier: identifier.clone(),
        height,
        round: 1,
        signers: operators[..quorum(operators.len()).min(operators.len())].to_vec(),
        signature: Signature::new(height.to_be_bytes().repeat(12)),
        data: format!("{identifier}@{height}").into_bytes(),
    }
}

impl Devnet {
    pub fn new(config: &NodeConfig, nodes: usize, validators: usize) -> Self {
        let network = LocalNetwork::new();
        let registry = Arc::new(CommitteeRegistry::new());
        let operators: Vec<OperatorId> = (1..=nodes as u64).collect();
        let beacon = Arc::new(RecordingBeacon::default());

        let validator_keys: Vec<PublicKey> = (0..validators)
            .map(|_| {
                let mut key = vec![0u8; 48];
                rand::thread_rng().fill_bytes(&mut key);
                PublicKey::new(key)
            })
            .collect();
        for key in &validator_keys {
            registry.register(key.clone(), operators.clone());
        }

        let nodes = operators
            .iter()
            .map(|operator_id| {
                let endpoint = network.add_node(format!("node-{operator_id}"));
                let store = Arc::new(MemoryStore::new());
                register_sync_handlers(&endpoint, store.clone(), config.sync.page_size);
                let history = Arc::new(History::new(
                    store.clone(),
                    Arc::new(endpoint.clone()),
                    decided_pipeline(registry.clone()),
                    config.sync.clone(),
                ));

                let validators = validator_keys
                    .iter()
                    .enumerate()
                    .map(|(index, key)| {
                        let share = share(key.clone(), index as u64, *operator_id, &operators);
                        let runners = RunnerRole::iter()
                            .filter(|role| *role != RunnerRole::Committee)
                            .map(|role| {
                                Box::new(BaseRunner::<Duty>::new(
                                    Identifier::new(key.clone(), role),
                                    share.clone(),
                                    Arc::new(LocalConsensus::new(operators.len())),
                                    Arc::new(LocalSigner::new(*operator_id)),
                                    beacon.clone(),
                                    Arc::new(endpoint.clone()),
                                    store.clone(),
                                )) as Box<dyn Runner<Duty>>
                            })
                            .collect();
                        let options = Options::new(
                            DutyRunners::new(runners),
                            Arc::new(endpoint.clone()),
                            history.clone(),
                        )
                        .with_mode(config.mode)
                        .with_queue(config.queue.clone());
                        (key.clone(), Arc::new(Validator::new(share, options)))
                    })
                    .collect();

                DevnetNode {
                    operator_id: *operator_id,
                    endpoint,
                    store,
                    history,
                    validators,
                }
            })
            .collect();

        Self {
            network,
            registry,
            validator_keys,
            nodes,
        }
    }

    /// Gives node `i` the first `heights * (i + 1) / nodes` decided heights of every
    /// validator's attester log, so every node but the last lags behind.
    pub fn seed(&self, heights: u64) -> Result<()> {
        let operators: Vec<OperatorId> = self.nodes.iter().map(|node| node.operator_id).collect();
        let count = self.nodes.len() as u64;
        for (i, node) in self.nodes.iter().enumerate() {
            let held = heights * (i as u64 + 1) / count.max(1);
            for key in &self.validator_keys {
                let identifier = Identifier::new(key.clone(), RunnerRole::Attester);
                let msgs: Vec<_> = (0..held)
                    .map(|height| decided_message(&identifier, height, &operators))
                    .collect();
                node.store.save_decided(&msgs)?;
                if let Some(last) = msgs.last() {
                    node.store.save_last_decided(last)?;
                }
            }
            debug!(node = %node.endpoint.local_peer_id(), held, "Seeded decided history");
        }
        Ok(())
    }

    /// Forwards every envelope a node receives to the addressed validator.
    pub fn spawn_dispatchers(&self) {
        for node in &self.nodes {
            let Some(mut events) = node.endpoint.subscribe_events() else {
                continue;
            };
            let validators = node.validators.clone();
            let peer = node.endpoint.local_peer_id();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(envelope) => match validators.get(&envelope.msg_id.public_key) {
                            Some(validator) => validator.handle_message(envelope).await,
                            None => trace!(%peer, "Envelope for an unknown validator"),
                        },
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%peer, skipped, "Dispatcher lagging");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
    }

    pub async fn start_validators(&self) -> Result<()> {
        for node in &self.nodes {
            for validator in node.validators.values() {
                validator.start().await?;
            }
        }
        Ok(())
    }

    /// Runs a full decided sync of every validator's attester log on every node.
    pub async fn sync_all(&self) -> Result<()> {
        for node in &self.nodes {
            for key in &self.validator_keys {
                let identifier = Identifier::new(key.clone(), RunnerRole::Attester);
                let synced = node.history.sync_decided(&identifier, true).await?;
                let height = node
                    .store
                    .get_last_decided(&identifier)?
                    .map(|msg| msg.height);
                info!(
                    node = %node.endpoint.local_peer_id(),
                    %identifier,
                    synced,
                    ?height,
                    "Decided sync finished"
                );
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for node in &self.nodes {
            for validator in node.validators.values() {
                validator.stop().await;
            }
        }
    }
}
