use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;

pub type TransactionId = i64;
pub const INVALID_TRANSACTION_ID: TransactionId = -1;

pub type TableOid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state. Locks may only be acquired while Growing;
/// the lock manager flips a transaction to Shrinking on the first release
/// that its isolation level counts as the end of the growing phase, and the
/// deadlock detector flips victims straight to Aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One lock set per table-level mode, plus shared/exclusive row lock sets
/// keyed by owning table.
#[derive(Debug, Default)]
pub struct TransactionLockSets {
    pub shared_table_locks: HashSet<TableOid>,
    pub exclusive_table_locks: HashSet<TableOid>,
    pub intention_shared_table_locks: HashSet<TableOid>,
    pub intention_exclusive_table_locks: HashSet<TableOid>,
    pub shared_intention_exclusive_table_locks: HashSet<TableOid>,
    pub shared_row_locks: HashMap<TableOid, HashSet<RecordId>>,
    pub exclusive_row_locks: HashMap<TableOid, HashSet<RecordId>>,
}

impl TransactionLockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_table_locks,
            LockMode::Exclusive => &mut self.exclusive_table_locks,
            LockMode::IntentionShared => &mut self.intention_shared_table_locks,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table_locks,
            LockMode::SharedIntentionExclusive => {
                &mut self.shared_intention_exclusive_table_locks
            }
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<TransactionLockSets>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(TransactionLockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// The table-level mode this transaction holds on `oid`, if any.
    pub fn held_table_mode(&self, oid: TableOid) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets.exclusive_table_locks.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if sets.shared_intention_exclusive_table_locks.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if sets.intention_exclusive_table_locks.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if sets.shared_table_locks.contains(&oid) {
            Some(LockMode::Shared)
        } else if sets.intention_shared_table_locks.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_row_locks
            .get(&oid)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false)
            || sets
                .exclusive_row_locks
                .get(&oid)
                .map(|rows| !rows.is_empty())
                .unwrap_or(false)
    }

    pub fn holds_row_lock(&self, oid: TableOid, rid: RecordId) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_row_locks
            .get(&oid)
            .map(|rows| rows.contains(&rid))
            .unwrap_or(false)
            || sets
                .exclusive_row_locks
                .get(&oid)
                .map(|rows| rows.contains(&rid))
                .unwrap_or(false)
    }

    pub(crate) fn record_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn erase_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn record_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => {
                sets.shared_row_locks.entry(oid).or_default().insert(rid);
            }
            LockMode::Exclusive => {
                sets.exclusive_row_locks.entry(oid).or_default().insert(rid);
            }
            _ => {}
        }
    }

    pub(crate) fn erase_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        match mode {
            LockMode::Shared => {
                if let Some(rows) = sets.shared_row_locks.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            LockMode::Exclusive => {
                if let Some(rows) = sets.exclusive_row_locks.get_mut(&oid) {
                    rows.remove(&rid);
                }
            }
            _ => {}
        }
    }
}
