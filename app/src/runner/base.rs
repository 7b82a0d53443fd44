use super::{Error, Runner, RunnerState};
use crate::network::Network;
use crate::store::DecidedStore;
use async_trait::async_trait;
use protocol::{
    DutyInfo, Envelope, Identifier, OperatorId, PartialSigPhase, PartialSignatureMessage,
    RunnerRole, Share, Signature, SignedConsensusMessage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

/// Agreement black box. Given a value to agree on it eventually reports a
/// decided message, or keeps the instance open.
#[async_trait]
pub trait Consensus: Send + Sync {
    async fn start_instance(
        &self,
        identifier: &Identifier,
        height: u64,
        value: Vec<u8>,
    ) -> Result<(), Error>;

    /// Returns the decided message once the instance reaches a decision.
    async fn process(
        &self,
        msg: &SignedConsensusMessage,
    ) -> Result<Option<SignedConsensusMessage>, Error>;
}

pub trait Signer: Send + Sync {
    fn sign(
        &self,
        phase: PartialSigPhase,
        slot: u64,
        root: &[u8],
    ) -> Result<PartialSignatureMessage, Error>;

    fn reconstruct(&self, shares: &[PartialSignatureMessage]) -> Result<Signature, Error>;
}

#[async_trait]
pub trait BeaconSubmitter: Send + Sync {
    /// Value the committee has to agree on for a duty.
    async fn duty_data(&self, role: RunnerRole, slot: u64) -> Result<Vec<u8>, Error>;

    async fn submit(
        &self,
        role: RunnerRole,
        slot: u64,
        value: &[u8],
        signature: Signature,
    ) -> Result<(), Error>;
}

/// Runner shared by every role, specialised only by the role it is built for.
pub struct BaseRunner<D> {
    identifier: Identifier,
    share: Share,
    consensus: Arc<dyn Consensus>,
    signer: Arc<dyn Signer>,
    beacon: Arc<dyn BeaconSubmitter>,
    network: Arc<dyn Network>,
    store: Arc<dyn DecidedStore>,
    state: RunnerState,
    duty: Option<D>,
    decided_value: Option<Vec<u8>>,
    pre_consensus: BTreeMap<OperatorId, PartialSignatureMessage>,
    post_consensus: BTreeMap<OperatorId, PartialSignatureMessage>,
}

impl<D: DutyInfo> BaseRunner<D> {
    pub fn new(
        identifier: Identifier,
        share: Share,
        consensus: Arc<dyn Consensus>,
        signer: Arc<dyn Signer>,
        beacon: Arc<dyn BeaconSubmitter>,
        network: Arc<dyn Network>,
        store: Arc<dyn DecidedStore>,
    ) -> Self {
        Self {
            identifier,
            share,
            consensus,
            signer,
            beacon,
            network,
            store,
            state: RunnerState::NotStarted,
            duty: None,
            decided_value: None,
            pre_consensus: BTreeMap::new(),
            post_consensus: BTreeMap::new(),
        }
    }

    fn running_slot(&self) -> u64 {
        self.duty.as_ref().map(|duty| duty.slot()).unwrap_or_default()
    }

    fn expect_state(&self, expected: RunnerState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::UnexpectedPhase {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn check_partial(
        &self,
        msg: &PartialSignatureMessage,
        phase: PartialSigPhase,
    ) -> Result<(), Error> {
        if msg.phase != phase {
            return Err(Error::WrongPhase(msg.phase));
        }
        let slot = self.running_slot();
        if msg.slot != slot {
            return Err(Error::SlotMismatch {
                expected: slot,
                got: msg.slot,
            });
        }
        if !self.share.is_member(msg.signer) {
            return Err(Error::UnknownSigner(msg.signer));
        }
        Ok(())
    }

    async fn broadcast_partial(&self, msg: &PartialSignatureMessage) -> Result<(), Error> {
        let envelope = Envelope::partial_signature(self.identifier.clone(), msg)?;
        self.network.broadcast(envelope).await?;
        Ok(())
    }

    /// Signs `root` for `phase`, keeps the own share and sends it to the committee.
    async fn sign_and_broadcast(&mut self, phase: PartialSigPhase, root: &[u8]) -> Result<(), Error> {
        let msg = self.signer.sign(phase, self.running_slot(), root)?;
        self.broadcast_partial(&msg).await?;
        let collected = match phase {
            PartialSigPhase::PreConsensus => &mut self.pre_consensus,
            PartialSigPhase::PostConsensus => &mut self.post_consensus,
        };
        collected.insert(msg.signer, msg);
        Ok(())
    }

    async fn start_consensus(&mut self) -> Result<(), Error> {
        let slot = self.running_slot();
        let value = self.beacon.duty_data(self.identifier.role, slot).await?;
        let height = self
            .store
            .get_last_decided(&self.identifier)?
            .map_or(0, |msg| msg.height + 1);

        self.consensus
            .start_instance(&self.identifier, height, value)
            .await?;
        self.state = RunnerState::Consensus;
        debug!(identifier = %self.identifier, slot, height, "Consensus started");
        Ok(())
    }

    fn reached_threshold(&self, collected: &BTreeMap<OperatorId, PartialSignatureMessage>) -> bool {
        collected.len() >= self.share.threshold
    }
}

#[async_trait]
impl<D: DutyInfo> Runner<D> for BaseRunner<D> {
    fn role(&self) -> RunnerRole {
        self.identifier.role
    }

    fn state(&self) -> RunnerState {
        self.state
    }

    async fn start_new_duty(&mut self, duty: D) -> Result<(), Error> {
        if duty.role() != self.identifier.role {
            return Err(Error::RoleMismatch {
                expected: self.identifier.role,
                got: duty.role(),
            });
        }
        // a newer slot abandons whatever is still running
        let idle = matches!(self.state, RunnerState::NotStarted | RunnerState::Finished);
        if !idle && duty.slot() <= self.running_slot() {
            return Err(Error::DutyRunning(self.running_slot()));
        }

        let slot = duty.slot();
        self.duty = Some(duty);
        self.decided_value = None;
        self.pre_consensus.clear();
        self.post_consensus.clear();
        info!(identifier = %self.identifier, slot, "Starting duty");

        if self.identifier.role.requires_pre_consensus() {
            self.state = RunnerState::PreConsensus;
            self.sign_and_broadcast(PartialSigPhase::PreConsensus, &slot.to_be_bytes())
                .await
        } else {
            self.start_consensus().await
        }
    }

    async fn process_consensus(&mut self, msg: SignedConsensusMessage) -> Result<(), Error> {
        self.expect_state(RunnerState::Consensus)?;

        let Some(decided) = self.consensus.process(&msg).await? else {
            return Ok(());
        };
        let local = self
            .store
            .get_last_decided(&self.identifier)?
            .map(|msg| msg.height);
        if local.map_or(true, |height| decided.height > height) {
            self.store.save_last_decided(&decided)?;
            info!(identifier = %self.identifier, height = decided.height, "Decided");
        } else {
            debug!(
                identifier = %self.identifier,
                height = decided.height,
                ?local,
                "Decided at or below the stored height, not persisting"
            );
        }

        self.state = RunnerState::PostConsensus;
        self.decided_value = Some(decided.data.clone());
        self.sign_and_broadcast(PartialSigPhase::PostConsensus, &decided.data)
            .await
    }

    async fn process_pre_consensus(&mut self, msg: PartialSignatureMessage) -> Result<(), Error> {
        self.expect_state(RunnerState::PreConsensus)?;
        self.check_partial(&msg, PartialSigPhase::PreConsensus)?;

        self.pre_consensus.insert(msg.signer, msg);
        if !self.reached_threshold(&self.pre_consensus) {
            return Ok(());
        }
        let shares: Vec<_> = self.pre_consensus.values().cloned().collect();
        self.signer.reconstruct(&shares)?;
        self.start_consensus().await
    }

    async fn process_post_consensus(
        &mut self,
        msg: PartialSignatureMessage,
    ) -> Result<(), Error> {
        self.expect_state(RunnerState::PostConsensus)?;
        self.check_partial(&msg, PartialSigPhase::PostConsensus)?;

        self.post_consensus.insert(msg.signer, msg);
        if !self.reached_threshold(&self.post_consensus) {
            return Ok(());
        }
        let shares: Vec<_> = self.post_consensus.values().cloned().collect();
        let signature = self.signer.reconstruct(&shares)?;
        let value = self.decided_value.take().unwrap_or_default();
        self.beacon
            .submit(self.identifier.role, self.running_slot(), &value, signature)
            .await?;

        self.state = RunnerState::Finished;
        info!(identifier = %self.identifier, slot = self.running_slot(), "Duty finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::runner::local::{test_share, LocalConsensus, LocalSigner, RecordingBeacon};
    use crate::store::MemoryStore;
    use protocol::{ConsensusMsgType, Duty, PublicKey};

    struct Harness {
        runner: BaseRunner<Duty>,
        beacon: Arc<RecordingBeacon>,
        store: Arc<MemoryStore>,
        identifier: Identifier,
    }

    fn harness(role: RunnerRole) -> Harness {
        let share = test_share(1);
        let identifier = Identifier::new(share.validator_public_key.clone(), role);
        let network = LocalNetwork::new();
        let beacon = Arc::new(RecordingBeacon::default());
        let store = Arc::new(MemoryStore::new());
        let runner = BaseRunner::new(
            identifier.clone(),
            share.clone(),
            Arc::new(LocalConsensus::new(share.committee.len())),
            Arc::new(LocalSigner::new(share.operator_id)),
            beacon.clone(),
            Arc::new(network.add_node("0")),
            store.clone(),
        );
        Harness {
            runner,
            beacon,
            store,
            identifier,
        }
    }

    fn duty(role: RunnerRole, slot: u64) -> Duty {
        Duty {
            role,
            slot,
            validator_index: 1,
            validator_public_key: test_share(1).validator_public_key,
        }
    }

    fn partial(phase: PartialSigPhase, slot: u64, signer: OperatorId) -> PartialSignatureMessage {
        PartialSignatureMessage {
            phase,
            slot,
            signer,
            signature: Signature::new(vec![signer as u8; 96]),
        }
    }

    fn commit(identifier: &Identifier, height: u64, signers: Vec<OperatorId>) -> SignedConsensusMessage {
        SignedConsensusMessage {
            msg_type: ConsensusMsgType::Commit,
            identifier: identifier.clone(),
            height,
            round: 1,
            signers,
            signature: Signature::new(vec![1u8; 96]),
            data: b"attestation".to_vec(),
        }
    }

    #[tokio::test]
    async fn attester_runs_to_finished() {
        let mut h = harness(RunnerRole::Attester);
        h.runner.start_new_duty(duty(RunnerRole::Attester, 12)).await.unwrap();
        assert_eq!(h.runner.state(), RunnerState::Consensus);

        // not a quorum yet
        h.runner
            .process_consensus(commit(&h.identifier, 0, vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(h.runner.state(), RunnerState::Consensus);

        h.runner
            .process_consensus(commit(&h.identifier, 0, vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(h.runner.state(), RunnerState::PostConsensus);
        assert_eq!(h.store.get_last_decided(&h.identifier).unwrap().unwrap().height, 0);

        // own share is already counted, threshold is 3
        h.runner
            .process_post_consensus(partial(PartialSigPhase::PostConsensus, 12, 2))
            .await
            .unwrap();
        assert_eq!(h.runner.state(), RunnerState::PostConsensus);
        h.runner
            .process_post_consensus(partial(PartialSigPhase::PostConsensus, 12, 3))
            .await
            .unwrap();
        assert_eq!(h.runner.state(), RunnerState::Finished);

        let submitted = h.beacon.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, RunnerRole::Attester);
        assert_eq!(submitted[0].1, 12);
    }

    #[tokio::test]
    async fn proposer_collects_pre_consensus_first() {
        let mut h = harness(RunnerRole::Proposer);
        h.runner.start_new_duty(duty(RunnerRole::Proposer, 5)).await.unwrap();
        assert_eq!(h.runner.state(), RunnerState::PreConsensus);

        let err = h
            .runner
            .process_consensus(commit(&h.identifier, 0, vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedPhase { .. }));

        for signer in [2, 3] {
            h.runner
                .process_pre_consensus(partial(PartialSigPhase::PreConsensus, 5, signer))
                .await
                .unwrap();
        }
        assert_eq!(h.runner.state(), RunnerState::Consensus);
    }

    #[tokio::test]
    async fn partial_signatures_are_checked() {
        let mut h = harness(RunnerRole::Aggregator);
        h.runner.start_new_duty(duty(RunnerRole::Aggregator, 5)).await.unwrap();

        let wrong_slot = h
            .runner
            .process_pre_consensus(partial(PartialSigPhase::PreConsensus, 6, 2))
            .await;
        assert!(matches!(wrong_slot, Err(Error::SlotMismatch { expected: 5, got: 6 })));

        let outsider = h
            .runner
            .process_pre_consensus(partial(PartialSigPhase::PreConsensus, 5, 9))
            .await;
        assert!(matches!(outsider, Err(Error::UnknownSigner(9))));

        let wrong_phase = h
            .runner
            .process_pre_consensus(partial(PartialSigPhase::PostConsensus, 5, 2))
            .await;
        assert!(matches!(wrong_phase, Err(Error::WrongPhase(_))));
        assert_eq!(h.runner.state(), RunnerState::PreConsensus);
    }

    #[tokio::test]
    async fn duty_lifecycle_guards() {
        let mut h = harness(RunnerRole::Attester);
        let wrong_role = h.runner.start_new_duty(duty(RunnerRole::Proposer, 1)).await;
        assert!(matches!(wrong_role, Err(Error::RoleMismatch { .. })));
        assert_eq!(h.runner.state(), RunnerState::NotStarted);

        h.runner.start_new_duty(duty(RunnerRole::Attester, 3)).await.unwrap();
        let same_slot = h.runner.start_new_duty(duty(RunnerRole::Attester, 3)).await;
        assert!(matches!(same_slot, Err(Error::DutyRunning(3))));
        h.runner.start_new_duty(duty(RunnerRole::Attester, 4)).await.unwrap();
        assert_eq!(h.runner.state(), RunnerState::Consensus);
    }

    #[tokio::test]
    async fn consensus_height_follows_last_decided() {
        let mut h = harness(RunnerRole::Attester);
        h.store
            .save_last_decided(&commit(&h.identifier, 7, vec![1, 2, 3]))
            .unwrap();
        h.runner.start_new_duty(duty(RunnerRole::Attester, 3)).await.unwrap();

        h.runner
            .process_consensus(commit(&h.identifier, 8, vec![2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(h.store.get_last_decided(&h.identifier).unwrap().unwrap().height, 8);

        let other = Identifier::new(PublicKey::new(vec![3u8; 48]), RunnerRole::Attester);
        assert!(h.store.get_last_decided(&other).unwrap().is_none());
    }

    #[tokio::test]
    async fn decision_below_synced_height_keeps_pointer() {
        let mut h = harness(RunnerRole::Attester);
        h.runner.start_new_duty(duty(RunnerRole::Attester, 2)).await.unwrap();

        // a background sync lands heights 0..=9 while the instance at 0 runs
        let synced: Vec<_> = (0..10)
            .map(|height| commit(&h.identifier, height, vec![2, 3, 4]))
            .collect();
        h.store.save_decided(&synced).unwrap();
        h.store.save_last_decided(&synced[9]).unwrap();

        h.runner
            .process_consensus(commit(&h.identifier, 0, vec![1, 2, 3]))
            .await
            .unwrap();
        // the duty still moves on to signing
        assert_eq!(h.runner.state(), RunnerState::PostConsensus);

        assert_eq!(h.store.get_last_decided(&h.identifier).unwrap().unwrap().height, 9);
        let stored = h.store.get_decided_range(&h.identifier, 0, 0).unwrap();
        assert_eq!(stored[0].signers, vec![2, 3, 4]);
    }
}
