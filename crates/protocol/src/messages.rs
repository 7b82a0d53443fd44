use crate::{quorum, CommitteeDuty, Duty, Encode, Error, Identifier, OperatorId};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Consensus,
    PartialSignature,
    Event,
}

/// Network message as received from a topic. The payload stays opaque until
/// the receiving actor decodes it according to `msg_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MsgType,
    pub msg_id: Identifier,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn consensus(msg: &SignedConsensusMessage) -> Result<Self, Error> {
        Ok(Self {
            msg_type: MsgType::Consensus,
            msg_id: msg.identifier.clone(),
            data: msg.encode()?,
        })
    }

    pub fn partial_signature(
        msg_id: Identifier,
        msg: &PartialSignatureMessage,
    ) -> Result<Self, Error> {
        Ok(Self {
            msg_type: MsgType::PartialSignature,
            msg_id,
            data: msg.encode()?,
        })
    }

    pub fn event(msg_id: Identifier, event: &EventMsg) -> Result<Self, Error> {
        Ok(Self {
            msg_type: MsgType::Event,
            msg_id,
            data: event.encode()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusMsgType {
    Proposal,
    Prepare,
    Commit,
    RoundChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConsensusMessage {
    pub msg_type: ConsensusMsgType,
    pub identifier: Identifier,
    pub height: u64,
    pub round: u64,
    pub signers: Vec<OperatorId>,
    pub signature: Signature,
    pub data: Vec<u8>,
}

impl SignedConsensusMessage {
    pub fn has_unique_signers(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.signers.len());
        self.signers.iter().all(|signer| seen.insert(*signer))
    }

    /// A message is decided once its (distinct) signer set reaches quorum.
    pub fn is_decided(&self, committee_size: usize) -> bool {
        committee_size > 0
            && self.has_unique_signers()
            && self.signers.len() >= quorum(committee_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialSigPhase {
    PreConsensus,
    PostConsensus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatureMessage {
    pub phase: PartialSigPhase,
    /// Slot of the duty this share was produced for
    pub slot: u64,
    pub signer: OperatorId,
    pub signature: Signature,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventMsg {
    ExecuteDuty(Duty),
    ExecuteCommitteeDuty(CommitteeDuty),
}
