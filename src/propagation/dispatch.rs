//! Propagation state machine.
//!
//! | type          | ambient tx present       | ambient tx absent |
//! |---------------|--------------------------|-------------------|
//! | REQUIRED      | join                     | start new         |
//! | REQUIRES_NEW  | savepoint of ambient     | start new         |
//! | SUPPORTS      | join                     | run bare          |
//! | MANDATORY     | join                     | NoTransaction     |
//! | NOT_SUPPORTED | run bare, ambient hidden | run bare          |
//! | NEVER         | UnexpectedTransaction    | run bare          |

use crate::propagation::error::{PropagationError, PropagationResult};
use crate::types::{PropagationType, TransactionId};

/// What a decorated call does with the ambient transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    JoinExisting(TransactionId),
    StartNew,
    /// Savepoint under the given transaction, owned by the call.
    StartNested(TransactionId),
    RunBare,
    /// Run bare with the given transaction hidden from the body.
    RunSuspended(TransactionId),
}

impl Decision {
    /// Whether the call owns (and must complete) a transaction.
    pub fn owns_transaction(&self) -> bool {
        matches!(self, Decision::StartNew | Decision::StartNested(_))
    }
}

/// Decide from the declared type and the ambient transaction.
pub fn decide(
    propagation: PropagationType,
    ambient: Option<&TransactionId>,
    caller: &str,
) -> PropagationResult<Decision> {
    let decision = match (propagation, ambient) {
        (PropagationType::Required, Some(tx)) => Decision::JoinExisting(tx.clone()),
        (PropagationType::Required, None) => Decision::StartNew,

        (PropagationType::RequiresNew, Some(tx)) => Decision::StartNested(tx.clone()),
        (PropagationType::RequiresNew, None) => Decision::StartNew,

        (PropagationType::Supports, Some(tx)) => Decision::JoinExisting(tx.clone()),
        (PropagationType::Supports, None) => Decision::RunBare,

        (PropagationType::Mandatory, Some(tx)) => Decision::JoinExisting(tx.clone()),
        (PropagationType::Mandatory, None) => {
            return Err(PropagationError::NoTransaction {
                caller: caller.to_string(),
            })
        }

        (PropagationType::NotSupported, Some(tx)) => Decision::RunSuspended(tx.clone()),
        (PropagationType::NotSupported, None) => Decision::RunBare,

        (PropagationType::Never, Some(tx)) => {
            return Err(PropagationError::UnexpectedTransaction {
                caller: caller.to_string(),
                tx_id: tx.clone(),
            })
        }
        (PropagationType::Never, None) => Decision::RunBare,
    };

    log::debug!("{} {} with ambient {:?} -> {:?}", caller, propagation, ambient, decision);
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> TransactionId {
        TransactionId::new("trx-db-1")
    }

    #[test]
    fn test_decision_table_with_ambient() {
        let t = tx();
        let cases = [
            (PropagationType::Required, Decision::JoinExisting(t.clone())),
            (PropagationType::RequiresNew, Decision::StartNested(t.clone())),
            (PropagationType::Supports, Decision::JoinExisting(t.clone())),
            (PropagationType::Mandatory, Decision::JoinExisting(t.clone())),
            (PropagationType::NotSupported, Decision::RunSuspended(t.clone())),
        ];
        for (propagation, expected) in cases {
            assert_eq!(decide(propagation, Some(&t), "Svc:m").unwrap(), expected, "{}", propagation);
        }
        assert_eq!(
            decide(PropagationType::Never, Some(&t), "Svc:m").unwrap_err(),
            PropagationError::UnexpectedTransaction {
                caller: "Svc:m".into(),
                tx_id: t.clone()
            }
        );
    }

    #[test]
    fn test_decision_table_without_ambient() {
        let cases = [
            (PropagationType::Required, Decision::StartNew),
            (PropagationType::RequiresNew, Decision::StartNew),
            (PropagationType::Supports, Decision::RunBare),
            (PropagationType::NotSupported, Decision::RunBare),
            (PropagationType::Never, Decision::RunBare),
        ];
        for (propagation, expected) in cases {
            assert_eq!(decide(propagation, None, "Svc:m").unwrap(), expected, "{}", propagation);
        }
        assert!(matches!(
            decide(PropagationType::Mandatory, None, "Svc:m"),
            Err(PropagationError::NoTransaction { .. })
        ));
    }

    #[test]
    fn test_ownership() {
        assert!(Decision::StartNew.owns_transaction());
        assert!(Decision::StartNested(tx()).owns_transaction());
        assert!(!Decision::JoinExisting(tx()).owns_transaction());
        assert!(!Decision::RunSuspended(tx()).owns_transaction());
    }
}
