//! Duty runners: one state machine per role, driven by the owning actor.

mod base;
pub mod local;

pub use base::{BaseRunner, BeaconSubmitter, Consensus, Signer};

use async_trait::async_trait;
use protocol::{
    DutyInfo, Identifier, OperatorId, PartialSigPhase, PartialSignatureMessage, RunnerRole,
    SignedConsensusMessage,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duty of role {got} handed to the {expected} runner")]
    RoleMismatch {
        expected: RunnerRole,
        got: RunnerRole,
    },
    #[error("Duty for slot {0} is still running")]
    DutyRunning(u64),
    #[error("Runner is in {actual}, message needs {expected}")]
    UnexpectedPhase {
        expected: RunnerState,
        actual: RunnerState,
    },
    #[error("Partial signature has phase {0:?}")]
    WrongPhase(PartialSigPhase),
    #[error("Message for slot {got}, running slot {expected}")]
    SlotMismatch { expected: u64, got: u64 },
    #[error("Signer {0} is not a committee member")]
    UnknownSigner(OperatorId),
    #[error("Consensus failure: {0}")]
    Consensus(String),
    #[error("Signing failure: {0}")]
    Signer(String),
    #[error("Beacon failure: {0}")]
    Beacon(String),
    #[error("Network error: {0}")]
    Network(#[from] crate::network::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    NotStarted,
    PreConsensus,
    Consensus,
    PostConsensus,
    Finished,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State machine executing duties of a single role.
///
/// The owning actor hands out `&mut` access behind a per-runner lock, so calls
/// reach a runner one at a time and in receipt order.
#[async_trait]
pub trait Runner<D: DutyInfo>: Send + Sync {
    fn role(&self) -> RunnerRole;

    fn state(&self) -> RunnerState;

    async fn start_new_duty(&mut self, duty: D) -> Result<(), Error>;

    async fn process_consensus(&mut self, msg: SignedConsensusMessage) -> Result<(), Error>;

    async fn process_pre_consensus(&mut self, msg: PartialSignatureMessage) -> Result<(), Error>;

    async fn process_post_consensus(&mut self, msg: PartialSignatureMessage)
        -> Result<(), Error>;
}

pub type SharedRunner<D> = Arc<Mutex<Box<dyn Runner<D>>>>;

/// Role to runner mapping of one actor, fixed at construction.
pub struct DutyRunners<D> {
    runners: HashMap<RunnerRole, SharedRunner<D>>,
}

impl<D: DutyInfo> DutyRunners<D> {
    pub fn new(runners: Vec<Box<dyn Runner<D>>>) -> Self {
        let mut map = HashMap::with_capacity(runners.len());
        for runner in runners {
            let role = runner.role();
            if map.insert(role, Arc::new(Mutex::new(runner))).is_some() {
                warn!(%role, "Replacing duplicate runner");
            }
        }
        Self { runners: map }
    }

    pub fn runner_for_role(&self, role: RunnerRole) -> Option<SharedRunner<D>> {
        self.runners.get(&role).cloned()
    }

    /// Runner whose role matches the identifier's role.
    pub fn duty_runner_for(&self, identifier: &Identifier) -> Option<SharedRunner<D>> {
        self.runner_for_role(identifier.role)
    }

    pub fn roles(&self) -> Vec<RunnerRole> {
        let mut roles: Vec<_> = self.runners.keys().copied().collect();
        roles.sort();
        roles
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
