use crate::PublicKey;
use serde_derive::{Deserialize, Serialize};

pub type OperatorId = u64;

/// Minimum number of signers that is strictly more than two thirds of `committee_size`.
pub fn quorum(committee_size: usize) -> usize {
    committee_size * 2 / 3 + 1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareMember {
    pub operator_id: OperatorId,
    pub share_public_key: PublicKey,
}

/// One operator's view of a split validator key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub validator_public_key: PublicKey,
    pub validator_index: u64,
    /// Operator running this share
    pub operator_id: OperatorId,
    pub committee: Vec<ShareMember>,
    /// Partial signatures needed to reconstruct the validator signature
    pub threshold: usize,
}

impl Share {
    pub fn committee_ids(&self) -> Vec<OperatorId> {
        self.committee.iter().map(|m| m.operator_id).collect()
    }

    pub fn is_member(&self, operator_id: OperatorId) -> bool {
        self.committee.iter().any(|m| m.operator_id == operator_id)
    }

    pub fn quorum(&self) -> usize {
        quorum(self.committee.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share() -> Share {
        Share {
            validator_public_key: PublicKey::new(vec![7u8; 48]),
            validator_index: 1,
            operator_id: 1,
            committee: (1..=4)
                .map(|id| ShareMember {
                    operator_id: id,
                    share_public_key: PublicKey::new(vec![id as u8; 48]),
                })
                .collect(),
            threshold: 3,
        }
    }

    #[test]
    fn quorum_is_more_than_two_thirds() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 3);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(7), 5);
        assert_eq!(quorum(10), 7);
    }

    #[test]
    fn committee_membership() {
        let share = share();
        assert_eq!(share.committee_ids(), vec![1, 2, 3, 4]);
        assert!(share.is_member(4));
        assert!(!share.is_member(5));
        assert_eq!(share.quorum(), 3);
    }
}
