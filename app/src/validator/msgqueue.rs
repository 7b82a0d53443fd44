use async_trait::async_trait;
use parking_lot::RwLock;
use protocol::{
    ConsensusMsgType, Decode, Envelope, Identifier, MsgType, PartialSigPhase,
    PartialSignatureMessage, SignedConsensusMessage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Names the bucket an envelope belongs to, if it belongs to this indexer at all.
pub struct Indexer {
    name: &'static str,
    matches: fn(&Envelope, usize) -> bool,
}

impl Indexer {
    pub fn new(name: &'static str, matches: fn(&Envelope, usize) -> bool) -> Self {
        Self { name, matches }
    }

    pub fn index_for(&self, identifier: &Identifier) -> String {
        format!("{}/{}", self.name, identifier)
    }

    /// Decided consensus messages, the signer set is at quorum.
    pub fn decided() -> Self {
        Self::new("decided", |envelope, committee_size| {
            decode_consensus(envelope).map_or(false, |msg| {
                msg.msg_type == ConsensusMsgType::Commit && msg.is_decided(committee_size)
            })
        })
    }

    pub fn consensus() -> Self {
        Self::new("consensus", |envelope, _| decode_consensus(envelope).is_some())
    }

    pub fn post_consensus() -> Self {
        Self::new("post_consensus", |envelope, _| {
            envelope.msg_type == MsgType::PartialSignature
                && PartialSignatureMessage::decode(&envelope.data)
                    .map_or(false, |msg| msg.phase == PartialSigPhase::PostConsensus)
        })
    }

    pub fn default_index() -> Self {
        Self::new("default", |_, _| true)
    }
}

fn decode_consensus(envelope: &Envelope) -> Option<SignedConsensusMessage> {
    if envelope.msg_type != MsgType::Consensus {
        return None;
    }
    SignedConsensusMessage::decode(&envelope.data).ok()
}

struct Queued {
    seq: u64,
    envelope: Envelope,
}

#[derive(Default)]
struct Buckets {
    next_seq: u64,
    items: HashMap<String, VecDeque<Queued>>,
}

/// In-memory buffer of inbound envelopes, bucketed by the first matching indexer.
///
/// Every envelope carries its arrival sequence, so the indices of one
/// identifier can still be drained in arrival order.
pub struct MsgQueue {
    indexers: Vec<Indexer>,
    committee_size: usize,
    buckets: RwLock<Buckets>,
    notify: Notify,
}

impl MsgQueue {
    /// `indexers` are tried in order, which is also the drain priority.
    pub fn new(indexers: Vec<Indexer>, committee_size: usize) -> Self {
        Self {
            indexers,
            committee_size,
            buckets: Default::default(),
            notify: Notify::new(),
        }
    }

    pub fn with_default_indexers(committee_size: usize) -> Self {
        Self::new(
            vec![
                Indexer::decided(),
                Indexer::consensus(),
                Indexer::post_consensus(),
                Indexer::default_index(),
            ],
            committee_size,
        )
    }

    /// Queues `envelope` and wakes the consumers. Returns the index it landed in.
    pub fn add(&self, envelope: Envelope) -> Option<String> {
        let indexer = self
            .indexers
            .iter()
            .find(|indexer| (indexer.matches)(&envelope, self.committee_size))?;
        let index = indexer.index_for(&envelope.msg_id);
        {
            let mut buckets = self.buckets.write();
            let seq = buckets.next_seq;
            buckets.next_seq += 1;
            buckets
                .items
                .entry(index.clone())
                .or_default()
                .push_back(Queued { seq, envelope });
        }
        self.notify.notify_waiters();
        Some(index)
    }

    /// Up to `n` envelopes from `index`, oldest first.
    pub fn pop(&self, n: usize, index: &str) -> Vec<Envelope> {
        let mut buckets = self.buckets.write();
        let Some(queue) = buckets.items.get_mut(index) else {
            return vec![];
        };
        let popped = queue
            .drain(..n.min(queue.len()))
            .map(|queued| queued.envelope)
            .collect();
        if queue.is_empty() {
            buckets.items.remove(index);
        }
        popped
    }

    /// Up to `n` envelopes across `indices`, in arrival order.
    pub fn pop_oldest(&self, n: usize, indices: &[String]) -> Vec<Envelope> {
        let mut buckets = self.buckets.write();
        let mut popped = Vec::new();
        while popped.len() < n {
            let oldest = indices
                .iter()
                .filter_map(|index| {
                    let seq = buckets.items.get(index)?.front()?.seq;
                    Some((seq, index))
                })
                .min_by_key(|(seq, _)| *seq)
                .map(|(_, index)| index);
            let Some(index) = oldest else {
                break;
            };
            let Some(queue) = buckets.items.get_mut(index) else {
                break;
            };
            if let Some(queued) = queue.pop_front() {
                popped.push(queued.envelope);
            }
            if queue.is_empty() {
                buckets.items.remove(index);
            }
        }
        popped
    }

    /// Position of the first of `indices` holding an envelope.
    pub fn first_pending(&self, indices: &[String]) -> Option<usize> {
        let buckets = self.buckets.read();
        indices
            .iter()
            .position(|index| buckets.items.contains_key(index))
    }

    pub fn count(&self, index: &str) -> usize {
        self.buckets
            .read()
            .items
            .get(index)
            .map_or(0, VecDeque::len)
    }

    /// Drops everything queued under `index`, returning how many were dropped.
    pub fn purge(&self, index: &str) -> usize {
        self.buckets
            .write()
            .items
            .remove(index)
            .map_or(0, |queue| queue.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.read().items.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every index of `identifier`, in drain priority.
    pub fn indices_for(&self, identifier: &Identifier) -> Vec<String> {
        self.indexers
            .iter()
            .map(|indexer| indexer.index_for(identifier))
            .collect()
    }
}

#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn consume(&self, envelope: Envelope);
}

/// Drains the indices of `identifiers` until `cancel` fires.
///
/// The identifier holding the highest priority index goes first, and its
/// envelopes are handed over in arrival order.
pub fn spawn_consumer<C: Consumer>(
    queue: Arc<MsgQueue>,
    identifiers: Vec<Identifier>,
    batch_size: usize,
    cancel: CancellationToken,
    consumer: Arc<C>,
) -> JoinHandle<()> {
    let groups: Vec<Vec<String>> = identifiers
        .iter()
        .map(|identifier| queue.indices_for(identifier))
        .collect();

    tokio::spawn(async move {
        loop {
            // registered before draining so an add in between is not missed
            let notified = queue.notify.notified();

            let next = groups
                .iter()
                .filter_map(|indices| Some((queue.first_pending(indices)?, indices)))
                .min_by_key(|(priority, _)| *priority);
            if let Some((_, indices)) = next {
                for envelope in queue.pop_oldest(batch_size.max(1), indices) {
                    consumer.consume(envelope).await;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notified => {}
            }
        }
        trace!(?identifiers, "Queue consumer stopped");
    })
}
