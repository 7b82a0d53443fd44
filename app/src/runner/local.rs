//! In-process capabilities used by the local devnet and tests.

use super::{BeaconSubmitter, Consensus, Error, Signer};
use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{
    quorum, ConsensusMsgType, Identifier, OperatorId, PartialSigPhase, PartialSignatureMessage,
    PublicKey, RunnerRole, Share, ShareMember, Signature, SignedConsensusMessage,
};
use tracing::*;

const SIGNATURE_LEN: usize = 96;

/// Share of `validator_public_key` held by `operator_id`, with a quorum threshold.
pub fn share(
    validator_public_key: PublicKey,
    validator_index: u64,
    operator_id: OperatorId,
    operators: &[OperatorId],
) -> Share {
    Share {
        validator_public_key,
        validator_index,
        operator_id,
        committee: operators
            .iter()
            .map(|id| ShareMember {
                operator_id: *id,
                share_public_key: PublicKey::new(id.to_be_bytes().to_vec()),
            })
            .collect(),
        threshold: quorum(operators.len()),
    }
}

#[cfg(test)]
pub(crate) fn test_share(operator_id: OperatorId) -> Share {
    share(PublicKey::new(vec![7u8; 48]), 1, operator_id, &[1, 2, 3, 4])
}

/// Decides as soon as a commit with a quorum of distinct signers arrives for
/// the running instance.
pub struct LocalConsensus {
    committee_size: usize,
    instance: Mutex<Option<(Identifier, u64)>>,
}

impl LocalConsensus {
    pub fn new(committee_size: usize) -> Self {
        Self {
            committee_size,
            instance: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn start_instance(
        &self,
        identifier: &Identifier,
        height: u64,
        _value: Vec<u8>,
    ) -> Result<(), Error> {
        *self.instance.lock() = Some((identifier.clone(), height));
        Ok(())
    }

    async fn process(
        &self,
        msg: &SignedConsensusMessage,
    ) -> Result<Option<SignedConsensusMessage>, Error> {
        let mut instance = self.instance.lock();
        let Some((identifier, height)) = instance.as_ref() else {
            return Err(Error::Consensus("no running instance".to_string()));
        };
        if msg.identifier != *identifier || msg.height != *height {
            trace!(height = msg.height, "Message for another instance");
            return Ok(None);
        }
        if msg.msg_type != ConsensusMsgType::Commit || !msg.is_decided(self.committee_size) {
            return Ok(None);
        }
        *instance = None;
        Ok(Some(msg.clone()))
    }
}

pub struct LocalSigner {
    operator_id: OperatorId,
}

impl LocalSigner {
    pub fn new(operator_id: OperatorId) -> Self {
        Self { operator_id }
    }
}

impl Signer for LocalSigner {
    fn sign(
        &self,
        phase: PartialSigPhase,
        slot: u64,
        root: &[u8],
    ) -> Result<PartialSignatureMessage, Error> {
        let mut signature = self.operator_id.to_be_bytes().to_vec();
        signature.extend_from_slice(root);
        signature.resize(SIGNATURE_LEN, 0);
        Ok(PartialSignatureMessage {
            phase,
            slot,
            signer: self.operator_id,
            signature: Signature::new(signature),
        })
    }

    fn reconstruct(&self, shares: &[PartialSignatureMessage]) -> Result<Signature, Error> {
        if shares.is_empty() {
            return Err(Error::Signer("no signature shares".to_string()));
        }
        let mut combined = vec![0u8; SIGNATURE_LEN];
        for share in shares {
            for (byte, other) in combined.iter_mut().zip(share.signature.as_bytes()) {
                *byte ^= other;
            }
        }
        Ok(Signature::new(combined))
    }
}

/// Serves placeholder duty data and keeps every submission.
#[derive(Default)]
pub struct RecordingBeacon {
    submitted: Mutex<Vec<(RunnerRole, u64, Vec<u8>, Signature)>>,
}

impl RecordingBeacon {
    pub fn submitted(&self) -> Vec<(RunnerRole, u64, Vec<u8>, Signature)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl BeaconSubmitter for RecordingBeacon {
    async fn duty_data(&self, role: RunnerRole, slot: u64) -> Result<Vec<u8>, Error> {
        Ok(format!("{role}:{slot}").into_bytes())
    }

    async fn submit(
        &self,
        role: RunnerRole,
        slot: u64,
        value: &[u8],
        signature: Signature,
    ) -> Result<(), Error> {
        info!(%role, slot, "Submitting signed duty");
        self.submitted
            .lock()
            .push((role, slot, value.to_vec(), signature));
        Ok(())
    }
}
