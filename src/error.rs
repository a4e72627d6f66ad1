use thiserror::Error;

use crate::transaction::lock_manager::AbortReason;
use crate::transaction::TransactionId;

pub type PetraResult<T, E = PetraError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum PetraError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl PetraError {
    /// The abort reason, if this error is a transaction abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            PetraError::TransactionAbort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
