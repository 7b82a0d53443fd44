mod duty;
mod identifier;
mod messages;
mod share;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use duty::{CommitteeDuty, Duty, DutyInfo};
pub use identifier::{Identifier, PublicKey, RunnerRole};
pub use messages::{
    ConsensusMsgType, Envelope, EventMsg, MsgType, PartialSigPhase, PartialSignatureMessage,
    Signature, SignedConsensusMessage,
};
pub use share::{quorum, OperatorId, Share, ShareMember};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Encoding failure: {0}")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Decoding failure: {0}")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[from] hex::FromHexError),
}

/// Msgpack encoding used for every payload that crosses the wire.
pub trait Encode {
    fn encode(&self) -> Result<Vec<u8>, Error>;
}

pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, Error>;
}

impl<T: Serialize> Encode for T {
    fn encode(&self) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }
}
