use parking_lot::RwLock;
use protocol::{quorum, Identifier, OperatorId, PublicKey, SignedConsensusMessage};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message belongs to {got}, expected {expected}")]
    IdentifierMismatch { expected: Identifier, got: Identifier },
    #[error("No committee known for {0}")]
    UnknownCommittee(PublicKey),
    #[error("Duplicate signers")]
    DuplicateSigners,
    #[error("Signer {0} is not a committee member")]
    NonCommitteeSigner(OperatorId),
    #[error("{signers} signers, quorum is {quorum}")]
    NoQuorum { signers: usize, quorum: usize },
    #[error("Empty signature")]
    EmptySignature,
    #[error("Rejected by {pipeline}: {reason}")]
    Rejected { pipeline: String, reason: String },
}

/// Validation step applied to each decided message fetched from a peer.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    fn run(
        &self,
        identifier: &Identifier,
        msg: &SignedConsensusMessage,
    ) -> Result<(), ValidationError>;
}

/// Member operator ids per validator public key or committee id.
#[derive(Default)]
pub struct CommitteeRegistry {
    committees: RwLock<HashMap<PublicKey, Vec<OperatorId>>>,
}

impl CommitteeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: PublicKey, members: Vec<OperatorId>) {
        self.committees.write().insert(owner, members);
    }

    pub fn committee(&self, owner: &PublicKey) -> Option<Vec<OperatorId>> {
        self.committees.read().get(owner).cloned()
    }

    pub fn remove(&self, owner: &PublicKey) {
        self.committees.write().remove(owner);
    }
}

struct FuncPipeline<F> {
    name: String,
    f: F,
}

impl<F> Pipeline for FuncPipeline<F>
where
    F: Fn(&SignedConsensusMessage) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _: &Identifier, msg: &SignedConsensusMessage) -> Result<(), ValidationError> {
        (self.f)(msg).map_err(|reason| ValidationError::Rejected {
            pipeline: self.name.clone(),
            reason,
        })
    }
}

/// Lifts a plain check into a named pipeline.
pub fn wrap_func<F>(name: impl Into<String>, f: F) -> Arc<dyn Pipeline>
where
    F: Fn(&SignedConsensusMessage) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(FuncPipeline {
        name: name.into(),
        f,
    })
}

struct Combined {
    name: String,
    pipelines: Vec<Arc<dyn Pipeline>>,
}

impl Pipeline for Combined {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        identifier: &Identifier,
        msg: &SignedConsensusMessage,
    ) -> Result<(), ValidationError> {
        self.pipelines
            .iter()
            .try_for_each(|pipeline| pipeline.run(identifier, msg))
    }
}

/// Runs `pipelines` in order, stopping at the first failure.
pub fn combine(pipelines: Vec<Arc<dyn Pipeline>>) -> Arc<dyn Pipeline> {
    let name = format!(
        "combination of: {}",
        pipelines
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Arc::new(Combined { name, pipelines })
}

pub struct IdentifierCheck;

impl Pipeline for IdentifierCheck {
    fn name(&self) -> &str {
        "identifier"
    }

    fn run(
        &self,
        identifier: &Identifier,
        msg: &SignedConsensusMessage,
    ) -> Result<(), ValidationError> {
        if msg.identifier != *identifier {
            return Err(ValidationError::IdentifierMismatch {
                expected: identifier.clone(),
                got: msg.identifier.clone(),
            });
        }
        Ok(())
    }
}

/// Distinct committee members signing, at least a quorum of the committee.
pub struct QuorumCheck {
    registry: Arc<CommitteeRegistry>,
}

impl QuorumCheck {
    pub fn new(registry: Arc<CommitteeRegistry>) -> Self {
        Self { registry }
    }
}

impl Pipeline for QuorumCheck {
    fn name(&self) -> &str {
        "quorum"
    }

    fn run(
        &self,
        identifier: &Identifier,
        msg: &SignedConsensusMessage,
    ) -> Result<(), ValidationError> {
        let committee = self
            .registry
            .committee(&identifier.public_key)
            .ok_or_else(|| ValidationError::UnknownCommittee(identifier.public_key.clone()))?;

        if !msg.has_unique_signers() {
            return Err(ValidationError::DuplicateSigners);
        }
        if let Some(outsider) = msg.signers.iter().find(|s| !committee.contains(s)) {
            return Err(ValidationError::NonCommitteeSigner(*outsider));
        }
        if !msg.is_decided(committee.len()) {
            return Err(ValidationError::NoQuorum {
                signers: msg.signers.len(),
                quorum: quorum(committee.len()),
            });
        }
        Ok(())
    }
}

pub struct SignatureNotEmpty;

impl Pipeline for SignatureNotEmpty {
    fn name(&self) -> &str {
        "signature"
    }

    fn run(&self, _: &Identifier, msg: &SignedConsensusMessage) -> Result<(), ValidationError> {
        if msg.signature.is_empty() {
            return Err(ValidationError::EmptySignature);
        }
        Ok(())
    }
}

/// Checks applied to decided messages received during sync.
pub fn decided_pipeline(registry: Arc<CommitteeRegistry>) -> Arc<dyn Pipeline> {
    combine(vec![
        Arc::new(IdentifierCheck),
        Arc::new(SignatureNotEmpty),
        Arc::new(QuorumCheck::new(registry)),
    ])
}
