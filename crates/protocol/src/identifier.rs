use crate::Error;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Raw public key bytes. Validators use 48 byte BLS keys, committees a 32 byte id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gossip topic every holder of this key subscribes to.
    pub fn topic(&self) -> String {
        format!("dv.{}", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for PublicKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // shorten, full keys are unreadable in logs
        let encoded = hex::encode(&self.0);
        if encoded.len() > 12 {
            write!(f, "PublicKey({}..)", &encoded[..12])
        } else {
            write!(f, "PublicKey({encoded})")
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum RunnerRole {
    Committee,
    Attester,
    Proposer,
    Aggregator,
    SyncCommittee,
    SyncCommitteeContribution,
}

impl RunnerRole {
    /// Roles that collect a partial signature quorum (randao, selection proofs)
    /// before consensus can start.
    pub fn requires_pre_consensus(&self) -> bool {
        matches!(
            self,
            RunnerRole::Proposer | RunnerRole::Aggregator | RunnerRole::SyncCommitteeContribution
        )
    }
}

/// Routing and sync partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub public_key: PublicKey,
    pub role: RunnerRole,
}

impl Identifier {
    pub fn new(public_key: PublicKey, role: RunnerRole) -> Self {
        Self { public_key, role }
    }

    /// Whether this identifier addresses the holder of `public_key`. Empty keys never match.
    pub fn belongs_to(&self, public_key: &PublicKey) -> bool {
        !self.public_key.is_empty() && self.public_key == *public_key
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.public_key, self.role)
    }
}
