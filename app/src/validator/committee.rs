use super::actor::ActorCore;
use super::{ActorState, Error, Options};
use protocol::{CommitteeDuty, Decode, DutyInfo, Envelope, EventMsg, MsgType, PublicKey, Share};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::*;

/// Actor running attestation and sync committee work for every validator of
/// one operator committee, under the committee id.
pub struct Committee {
    shares: BTreeMap<u64, Share>,
    core: Arc<ActorCore<CommitteeDuty>>,
}

impl Committee {
    /// `shares` are keyed by validator index.
    pub fn new(
        committee_id: PublicKey,
        shares: BTreeMap<u64, Share>,
        options: Options<CommitteeDuty>,
    ) -> Self {
        let committee_size = shares
            .values()
            .next()
            .map_or(0, |share| share.committee.len());
        Self {
            shares,
            core: Arc::new(ActorCore::new(committee_id, committee_size, options)),
        }
    }

    pub fn committee_id(&self) -> &PublicKey {
        self.core.public_key()
    }

    pub fn state(&self) -> ActorState {
        self.core.state()
    }

    pub async fn start(&self) -> Result<bool, Error> {
        self.core.start().await
    }

    pub async fn stop(&self) {
        self.core.stop().await
    }

    /// Unlike a validator, a committee is never started by a duty.
    pub async fn start_duty(&self, mut duty: CommitteeDuty) -> Result<(), Error> {
        duty.validator_duties.retain(|validator_duty| {
            let known = self.shares.get(&validator_duty.validator_index).map_or(false, |share| {
                share.validator_public_key == validator_duty.validator_public_key
            });
            if !known {
                warn!(
                    validator_index = validator_duty.validator_index,
                    "Dropping duty of a validator without share"
                );
            }
            known
        });
        self.core.start_duty(duty).await
    }

    pub async fn process_message(&self, envelope: Envelope) -> Result<(), Error> {
        self.core.process_message(envelope).await
    }

    pub async fn on_execute_duty(&self, event: EventMsg) -> Result<(), Error> {
        let EventMsg::ExecuteCommitteeDuty(duty) = event else {
            return Err(Error::UnexpectedEvent);
        };
        let span = info_span!("execute_committee_duty", slot = duty.slot(), role = %duty.role());
        self.start_duty(duty)
            .instrument(span)
            .await
            .map_err(|err| Error::StartDuty(Box::new(err)))
    }

    pub async fn handle_message(&self, envelope: Envelope) {
        if envelope.msg_type == MsgType::Event {
            let result = match EventMsg::decode(&envelope.data) {
                Ok(event) => self.on_execute_duty(event).await,
                Err(err) => Err(Error::Decode(err)),
            };
            if let Err(err) = result {
                warn!(identifier = %envelope.msg_id, "Could not execute committee duty: {err}");
            }
            return;
        }
        self.core.handle_message(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::network::LocalNetwork;
    use crate::runner::local::share;
    use crate::runner::test::RecordingRunner;
    use crate::runner::{DutyRunners, Runner};
    use crate::validator::test::history;
    use protocol::{
        ConsensusMsgType, Duty, Identifier, RunnerRole, Signature, SignedConsensusMessage,
    };

    struct Fixture {
        committee: Committee,
        calls: Arc<parking_lot::Mutex<Vec<String>>>,
        committee_id: PublicKey,
    }

    fn fixture() -> Fixture {
        let network = LocalNetwork::new();
        let node = network.add_node("0");
        let committee_id = PublicKey::new(vec![5u8; 32]);
        let shares = (1..=2)
            .map(|index| {
                let pk = PublicKey::new(vec![index as u8; 48]);
                (index, share(pk, index, 1, &[1, 2, 3, 4]))
            })
            .collect();
        let (runner, calls) = RecordingRunner::new(RunnerRole::Committee);
        let runners: Vec<Box<dyn Runner<CommitteeDuty>>> = vec![Box::new(runner)];
        let options = Options::new(DutyRunners::new(runners), Arc::new(node.clone()), history(&node))
            .with_mode(Mode::ReadOnly);
        Fixture {
            committee: Committee::new(committee_id.clone(), shares, options),
            calls,
            committee_id,
        }
    }

    fn validator_duty(index: u64) -> Duty {
        Duty {
            role: RunnerRole::Attester,
            slot: 9,
            validator_index: index,
            validator_public_key: PublicKey::new(vec![index as u8; 48]),
        }
    }

    #[tokio::test]
    async fn duties_do_not_start_the_committee() {
        let f = fixture();
        f.committee
            .start_duty(CommitteeDuty {
                slot: 9,
                validator_duties: vec![validator_duty(1), validator_duty(3)],
            })
            .await
            .unwrap();
        assert_eq!(f.committee.state(), ActorState::NotStarted);
        assert_eq!(*f.calls.lock(), vec!["duty:9"]);
    }

    #[tokio::test]
    async fn execute_committee_duty_event() {
        let f = fixture();
        let id = Identifier::new(f.committee_id.clone(), RunnerRole::Committee);
        let event = EventMsg::ExecuteCommitteeDuty(CommitteeDuty {
            slot: 2,
            validator_duties: vec![validator_duty(2)],
        });
        f.committee
            .handle_message(Envelope::event(id, &event).unwrap())
            .await;
        assert_eq!(*f.calls.lock(), vec!["duty:2"]);

        let wrong = EventMsg::ExecuteDuty(validator_duty(1));
        assert!(matches!(
            f.committee.on_execute_duty(wrong).await,
            Err(Error::UnexpectedEvent)
        ));
    }

    #[tokio::test]
    async fn routes_under_committee_id_only() {
        let f = fixture();
        let msg = |public_key: PublicKey| SignedConsensusMessage {
            msg_type: ConsensusMsgType::Commit,
            identifier: Identifier::new(public_key, RunnerRole::Committee),
            height: 1,
            round: 1,
            signers: vec![1, 2, 3],
            signature: Signature::new(vec![1u8; 96]),
            data: vec![1],
        };

        f.committee
            .process_message(Envelope::consensus(&msg(f.committee_id.clone())).unwrap())
            .await
            .unwrap();
        // validator keys of the committee are not its identity
        let err = f
            .committee
            .process_message(Envelope::consensus(&msg(PublicKey::new(vec![1u8; 48]))).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { .. }));
        assert_eq!(*f.calls.lock(), vec!["consensus:1"]);
    }

    #[tokio::test]
    async fn lifecycle() {
        let f = fixture();
        assert!(f.committee.start().await.unwrap());
        assert!(!f.committee.start().await.unwrap());
        f.committee.stop().await;
        assert!(matches!(
            f.committee
                .start_duty(CommitteeDuty {
                    slot: 1,
                    validator_duties: vec![]
                })
                .await,
            Err(Error::AlreadyStopped)
        ));
    }
}
