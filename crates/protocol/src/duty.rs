use crate::{PublicKey, RunnerRole};
use serde_derive::{Deserialize, Serialize};

/// Common view over the duty shapes a runner can be started with.
pub trait DutyInfo: Clone + Send + Sync + 'static {
    fn slot(&self) -> u64;
    fn role(&self) -> RunnerRole;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duty {
    pub role: RunnerRole,
    pub slot: u64,
    pub validator_index: u64,
    pub validator_public_key: PublicKey,
}

impl DutyInfo for Duty {
    fn slot(&self) -> u64 {
        self.slot
    }

    fn role(&self) -> RunnerRole {
        self.role
    }
}

/// Attestation and sync-committee work of several validators executed under
/// one committee identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeDuty {
    pub slot: u64,
    pub validator_duties: Vec<Duty>,
}

impl DutyInfo for CommitteeDuty {
    fn slot(&self) -> u64 {
        self.slot
    }

    fn role(&self) -> RunnerRole {
        RunnerRole::Committee
    }
}
