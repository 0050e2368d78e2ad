pub mod lock_manager;
pub mod manager;
pub mod wait_for_graph;

pub use lock_manager::{LockId, LockManager, LockMode};
pub use manager::{TransactionManager, TxnOutcome, TxnState, WriteRecord};

use core::fmt;

use crate::wal::TxnId;

/// A cheap handle to a transaction. All state lives in the
/// transaction manager; handles are freely cloned across operators.
#[derive(Eq, PartialEq, Clone, Copy, Hash)]
pub struct Transaction {
    id: TxnId,
}

impl Transaction {
    pub(crate) fn with_id(id: TxnId) -> Self {
        Self { id }
    }

    pub fn get_id(&self) -> TxnId {
        self.id
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
