//! Validator and committee actors: lifecycle, message validation and routing
//! to the duty runner of the addressed role.

mod actor;
mod committee;
pub mod msgqueue;

pub use committee::Committee;

use crate::config::{Mode, QueueConfig};
use crate::network::Network;
use crate::runner::DutyRunners;
use crate::sync::History;
use actor::ActorCore;
use protocol::{
    Decode, Duty, DutyInfo, Envelope, EventMsg, Identifier, MsgType, PublicKey, RunnerRole, Share,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duty type {0} not supported")]
    UnsupportedDutyType(RunnerRole),
    #[error("Could not get duty runner for msg ID {0}")]
    NoRunnerForMessage(Identifier),
    #[error("Msg ID {got} doesn't match actor ID {expected}")]
    IdentityMismatch { expected: PublicKey, got: PublicKey },
    #[error("Msg data is empty")]
    EmptyPayload,
    #[error("Could not decode message: {0}")]
    Decode(#[source] protocol::Error),
    #[error("Unknown msg type {0:?}")]
    UnknownMessageKind(MsgType),
    #[error("Actor already stopped")]
    AlreadyStopped,
    #[error("Unexpected event for this actor")]
    UnexpectedEvent,
    #[error("Could not start validator: {0}")]
    StartValidator(#[source] Box<Error>),
    #[error("Could not start duty: {0}")]
    StartDuty(#[source] Box<Error>),
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::Error),
    #[error("Network error: {0}")]
    Network(#[from] crate::network::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    NotStarted,
    Started,
    Stopped,
}

/// Collaborators and settings an actor is built from.
pub struct Options<D> {
    pub mode: Mode,
    pub queue: QueueConfig,
    pub runners: DutyRunners<D>,
    pub network: Arc<dyn Network>,
    pub history: Arc<History>,
}

impl<D: DutyInfo> Options<D> {
    pub fn new(runners: DutyRunners<D>, network: Arc<dyn Network>, history: Arc<History>) -> Self {
        Self {
            mode: Mode::default(),
            queue: QueueConfig::default(),
            runners,
            network,
            history,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    fn defaults(mut self) -> Self {
        if self.queue.consumers == 0 {
            self.queue.consumers = QueueConfig::default().consumers;
        }
        if self.queue.batch_size == 0 {
            self.queue.batch_size = QueueConfig::default().batch_size;
        }
        self
    }
}

/// Actor of one validator share. Duties force it to start.
pub struct Validator {
    share: Share,
    core: Arc<ActorCore<Duty>>,
}

impl Validator {
    pub fn new(share: Share, options: Options<Duty>) -> Self {
        let core = ActorCore::new(
            share.validator_public_key.clone(),
            share.committee.len(),
            options,
        );
        Self {
            share,
            core: Arc::new(core),
        }
    }

    pub fn share(&self) -> &Share {
        &self.share
    }

    pub fn state(&self) -> ActorState {
        self.core.state()
    }

    /// Subscribes the validator topic and syncs every role in the background.
    /// Returns `false` when the validator was already started.
    pub async fn start(&self) -> Result<bool, Error> {
        self.core.start().await
    }

    pub async fn stop(&self) {
        self.core.stop().await
    }

    pub async fn start_duty(&self, duty: Duty) -> Result<(), Error> {
        self.core.start().await?;
        self.core.start_duty(duty).await
    }

    pub async fn process_message(&self, envelope: Envelope) -> Result<(), Error> {
        self.core.process_message(envelope).await
    }

    pub async fn on_execute_duty(&self, event: EventMsg) -> Result<(), Error> {
        let EventMsg::ExecuteDuty(duty) = event else {
            return Err(Error::UnexpectedEvent);
        };
        let span = info_span!("execute_duty", slot = duty.slot(), role = %duty.role());
        async move {
            // force the validator to be started (subscribed to its topic and synced)
            self.core
                .start()
                .await
                .map_err(|err| Error::StartValidator(Box::new(err)))?;
            self.core
                .start_duty(duty)
                .await
                .map_err(|err| Error::StartDuty(Box::new(err)))
        }
        .instrument(span)
        .await
    }

    /// Entry point for envelopes delivered by the network.
    pub async fn handle_message(&self, envelope: Envelope) {
        if envelope.msg_type == MsgType::Event {
            let result = match EventMsg::decode(&envelope.data) {
                Ok(event) => self.on_execute_duty(event).await,
                Err(err) => Err(Error::Decode(err)),
            };
            if let Err(err) = result {
                warn!(identifier = %envelope.msg_id, "Could not execute duty: {err}");
            }
            return;
        }
        self.core.handle_message(envelope).await
    }

    /// Envelopes waiting in the queue, zero in read only mode.
    pub fn queued(&self) -> usize {
        self.core.queue().map_or(0, |queue| queue.len())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::network::{self as net, LocalNetwork, LocalNode, PeerId, RequestHandler};
    use crate::runner::local::test_share;
    use crate::runner::test::RecordingRunner;
    use crate::runner::Runner;
    use crate::store::MemoryStore;
    use crate::sync::{decided_pipeline, CommitteeRegistry};
    use protocol::{
        ConsensusMsgType, PartialSigPhase, PartialSignatureMessage, Signature,
        SignedConsensusMessage,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    pub(crate) fn history(node: &LocalNode) -> Arc<History> {
        Arc::new(History::new(
            Arc::new(MemoryStore::new()),
            Arc::new(node.clone()),
            decided_pipeline(Arc::new(CommitteeRegistry::new())),
            Default::default(),
        ))
    }

    struct Fixture {
        validator: Validator,
        calls: Arc<parking_lot::Mutex<Vec<String>>>,
        network: LocalNetwork,
        identifier: Identifier,
    }

    fn fixture(mode: Mode) -> Fixture {
        let network = LocalNetwork::new();
        let node = network.add_node("0");
        let share = test_share(1);
        let (attester, calls) = RecordingRunner::new(RunnerRole::Attester);
        let (proposer, _) = RecordingRunner::new(RunnerRole::Proposer);
        let runners: Vec<Box<dyn Runner<Duty>>> = vec![Box::new(attester), Box::new(proposer)];
        let options = Options::new(DutyRunners::new(runners), Arc::new(node.clone()), history(&node))
            .with_mode(mode);
        let identifier = Identifier::new(share.validator_public_key.clone(), RunnerRole::Attester);
        Fixture {
            validator: Validator::new(share, options),
            calls,
            network,
            identifier,
        }
    }

    fn consensus(identifier: &Identifier, height: u64) -> Envelope {
        Envelope::consensus(&SignedConsensusMessage {
            msg_type: ConsensusMsgType::Prepare,
            identifier: identifier.clone(),
            height,
            round: 1,
            signers: vec![2],
            signature: Signature::new(vec![1u8; 96]),
            data: vec![1],
        })
        .unwrap()
    }

    fn partial(identifier: &Identifier, phase: PartialSigPhase, signer: u64) -> Envelope {
        let msg = PartialSignatureMessage {
            phase,
            slot: 1,
            signer,
            signature: Signature::new(vec![1u8; 96]),
        };
        Envelope::partial_signature(identifier.clone(), &msg).unwrap()
    }

    fn duty(role: RunnerRole, slot: u64) -> Duty {
        Duty {
            role,
            slot,
            validator_index: 1,
            validator_public_key: test_share(1).validator_public_key,
        }
    }

    #[tokio::test]
    async fn routes_by_kind_and_phase() {
        let f = fixture(Mode::ReadOnly);
        f.validator.process_message(consensus(&f.identifier, 4)).await.unwrap();
        f.validator
            .process_message(partial(&f.identifier, PartialSigPhase::PreConsensus, 2))
            .await
            .unwrap();
        f.validator
            .process_message(partial(&f.identifier, PartialSigPhase::PostConsensus, 3))
            .await
            .unwrap();
        assert_eq!(*f.calls.lock(), vec!["consensus:4", "pre:2", "post:3"]);
    }

    #[tokio::test]
    async fn rejects_before_reaching_runner() {
        let f = fixture(Mode::ReadOnly);

        let mut no_runner = f.identifier.clone();
        no_runner.role = RunnerRole::Aggregator;
        assert!(matches!(
            f.validator.process_message(consensus(&no_runner, 1)).await,
            Err(Error::NoRunnerForMessage(_))
        ));

        let foreign = Identifier::new(PublicKey::new(vec![9u8; 48]), RunnerRole::Attester);
        assert!(matches!(
            f.validator.process_message(consensus(&foreign, 1)).await,
            Err(Error::IdentityMismatch { .. })
        ));

        let empty = Envelope {
            msg_type: MsgType::Consensus,
            msg_id: f.identifier.clone(),
            data: vec![],
        };
        assert!(matches!(
            f.validator.process_message(empty).await,
            Err(Error::EmptyPayload)
        ));

        let garbage = Envelope {
            msg_type: MsgType::PartialSignature,
            msg_id: f.identifier.clone(),
            data: vec![0xc1, 0x02],
        };
        assert!(matches!(
            f.validator.process_message(garbage).await,
            Err(Error::Decode(_))
        ));

        let event = Envelope::event(
            f.identifier.clone(),
            &EventMsg::ExecuteDuty(duty(RunnerRole::Attester, 1)),
        )
        .unwrap();
        assert!(matches!(
            f.validator.process_message(event).await,
            Err(Error::UnknownMessageKind(MsgType::Event))
        ));

        assert!(f.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_subscribes() {
        let f = fixture(Mode::ReadOnly);
        let other = f.network.add_node("1");
        other.subscribe(&f.identifier.public_key).await.unwrap();

        assert!(f.validator.start().await.unwrap());
        assert!(!f.validator.start().await.unwrap());
        assert_eq!(f.validator.state(), ActorState::Started);
        assert_eq!(other.peers(&f.identifier.public_key), vec![crate::network::PeerId::new("0")]);

        f.validator.stop().await;
        f.validator.stop().await;
        assert_eq!(f.validator.state(), ActorState::Stopped);
        assert!(other.peers(&f.identifier.public_key).is_empty());
        assert!(matches!(f.validator.start().await, Err(Error::AlreadyStopped)));
        assert!(matches!(
            f.validator.process_message(consensus(&f.identifier, 1)).await,
            Err(Error::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn concurrent_starts_transition_once() {
        let f = fixture(Mode::ReadOnly);
        let (a, b) = tokio::join!(f.validator.start(), f.validator.start());
        assert_eq!([a.unwrap(), b.unwrap()].iter().filter(|s| **s).count(), 1);
    }

    #[tokio::test]
    async fn duties_force_start() {
        let f = fixture(Mode::ReadOnly);
        f.validator.start_duty(duty(RunnerRole::Attester, 7)).await.unwrap();
        assert_eq!(f.validator.state(), ActorState::Started);
        assert_eq!(*f.calls.lock(), vec!["duty:7"]);

        assert!(matches!(
            f.validator.start_duty(duty(RunnerRole::SyncCommittee, 7)).await,
            Err(Error::UnsupportedDutyType(RunnerRole::SyncCommittee))
        ));
    }

    #[tokio::test]
    async fn execute_duty_event() {
        let f = fixture(Mode::ReadOnly);
        let event = Envelope::event(
            f.identifier.clone(),
            &EventMsg::ExecuteDuty(duty(RunnerRole::Proposer, 3)),
        )
        .unwrap();
        f.validator.handle_message(event).await;
        assert_eq!(f.validator.state(), ActorState::Started);

        f.validator.stop().await;
        let err = f
            .validator
            .on_execute_duty(EventMsg::ExecuteDuty(duty(RunnerRole::Attester, 4)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartValidator(_)));
        assert_eq!(err.to_string(), "Could not start validator: Actor already stopped");
    }

    #[tokio::test]
    async fn queued_messages_are_consumed_in_order() {
        let f = fixture(Mode::ReadWrite);
        f.validator.start().await.unwrap();

        for height in 0..5 {
            f.validator.handle_message(consensus(&f.identifier, height)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.calls.lock().len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *f.calls.lock(),
            (0..5).map(|h| format!("consensus:{h}")).collect::<Vec<_>>()
        );
        assert_eq!(f.validator.queued(), 0);
        f.validator.stop().await;
    }

    #[tokio::test]
    async fn undecodable_event_is_dropped() {
        let f = fixture(Mode::ReadOnly);
        let envelope = Envelope {
            msg_type: MsgType::Event,
            msg_id: f.identifier.clone(),
            data: vec![0xc1],
        };
        f.validator.handle_message(envelope).await;
        assert_eq!(f.validator.state(), ActorState::NotStarted);
    }

    #[tokio::test]
    async fn queue_only_takes_routable_envelopes() {
        let f = fixture(Mode::ReadWrite);
        f.validator.start().await.unwrap();

        let mut no_runner = f.identifier.clone();
        no_runner.role = RunnerRole::Aggregator;
        for height in 0..3 {
            f.validator.handle_message(consensus(&no_runner, height)).await;
        }
        let foreign = Identifier::new(PublicKey::new(vec![9u8; 48]), RunnerRole::Attester);
        f.validator.handle_message(consensus(&foreign, 1)).await;
        f.validator
            .handle_message(Envelope {
                msg_type: MsgType::Consensus,
                msg_id: f.identifier.clone(),
                data: vec![],
            })
            .await;

        assert_eq!(f.validator.queued(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.calls.lock().is_empty());
        f.validator.stop().await;
    }

    #[tokio::test]
    async fn queued_role_keeps_arrival_order() {
        let f = fixture(Mode::ReadWrite);
        let commit = Envelope::consensus(&SignedConsensusMessage {
            msg_type: ConsensusMsgType::Commit,
            identifier: f.identifier.clone(),
            height: 2,
            round: 1,
            signers: vec![1, 2, 3],
            signature: Signature::new(vec![1u8; 96]),
            data: vec![1],
        })
        .unwrap();
        // queued before any consumer runs, the commit lands in a higher priority index
        f.validator.handle_message(consensus(&f.identifier, 1)).await;
        f.validator.handle_message(commit).await;
        assert_eq!(f.validator.queued(), 2);

        f.validator.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.calls.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*f.calls.lock(), vec!["consensus:1", "consensus:2"]);
        f.validator.stop().await;
    }

    /// Subscribes only after a delay.
    struct SlowSubscribe(LocalNode);

    #[async_trait]
    impl Network for SlowSubscribe {
        fn local_peer_id(&self) -> PeerId {
            self.0.local_peer_id()
        }

        async fn subscribe(&self, public_key: &PublicKey) -> Result<(), net::Error> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.subscribe(public_key).await
        }

        async fn unsubscribe(&self, public_key: &PublicKey) -> Result<(), net::Error> {
            self.0.unsubscribe(public_key).await
        }

        async fn broadcast(&self, envelope: Envelope) -> Result<(), net::Error> {
            self.0.broadcast(envelope).await
        }

        fn peers(&self, public_key: &PublicKey) -> Vec<PeerId> {
            self.0.peers(public_key)
        }

        fn register_handler(&self, protocol: &str, handler: RequestHandler) {
            self.0.register_handler(protocol, handler)
        }

        async fn request(
            &self,
            peer: &PeerId,
            protocol: &str,
            request: Vec<u8>,
        ) -> Result<Vec<u8>, net::Error> {
            self.0.request(peer, protocol, request).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_subscribing_wins() {
        let network = LocalNetwork::new();
        let node = network.add_node("0");
        let other = network.add_node("1");
        let share = test_share(1);
        let (attester, calls) = RecordingRunner::new(RunnerRole::Attester);
        let runners: Vec<Box<dyn Runner<Duty>>> = vec![Box::new(attester)];
        let options = Options::new(
            DutyRunners::new(runners),
            Arc::new(SlowSubscribe(node.clone())),
            history(&node),
        );
        let validator = Validator::new(share.clone(), options);

        let (started, _) = tokio::join!(validator.start(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            validator.stop().await;
        });

        assert!(matches!(started, Err(Error::AlreadyStopped)));
        assert_eq!(validator.state(), ActorState::Stopped);
        assert!(other.peers(&share.validator_public_key).is_empty());
        assert!(calls.lock().is_empty());
    }
}
