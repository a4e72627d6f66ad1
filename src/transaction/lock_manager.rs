use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::LockManagerConfig;
use crate::error::{PetraError, PetraResult};
use crate::storage::page::RecordId;
use crate::transaction::{
    IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
    INVALID_TRANSACTION_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Stable reasons a lock-manager rule violation (or deadlock) aborts a
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AbortReason::LockOnShrinking => "LOCK_ON_SHRINKING",
            AbortReason::LockSharedOnReadUncommitted => "LOCK_SHARED_ON_READ_UNCOMMITTED",
            AbortReason::UpgradeConflict => "UPGRADE_CONFLICT",
            AbortReason::IncompatibleUpgrade => "INCOMPATIBLE_UPGRADE",
            AbortReason::AttemptedUnlockButNoLockHeld => "ATTEMPTED_UNLOCK_BUT_NO_LOCK_HELD",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "TABLE_UNLOCKED_BEFORE_UNLOCKING_ROWS"
            }
            AbortReason::AttemptedIntentionLockOnRow => "ATTEMPTED_INTENTION_LOCK_ON_ROW",
            AbortReason::TableLockNotPresent => "TABLE_LOCK_NOT_PRESENT",
        };
        f.write_str(name)
    }
}

/// rows = held, cols = requested; intention locks coexist with everything
/// but X, SIX only with IS, X with nothing.
pub fn are_modes_compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (Shared, Shared) => true,
        _ => false,
    }
}

/// The only permitted upgrade paths.
fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (held, requested),
        (IntentionShared, Shared)
            | (IntentionShared, Exclusive)
            | (IntentionShared, IntentionExclusive)
            | (IntentionShared, SharedIntentionExclusive)
            | (Shared, Exclusive)
            | (Shared, SharedIntentionExclusive)
            | (IntentionExclusive, Exclusive)
            | (IntentionExclusive, SharedIntentionExclusive)
            | (SharedIntentionExclusive, Exclusive)
    )
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    /// At most one transaction may have an upgrade in flight per queue.
    upgrading: TransactionId,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            upgrading: INVALID_TRANSACTION_ID,
        }
    }
}

#[derive(Debug, Default)]
struct LockResource {
    queue: Mutex<LockRequestQueue>,
    condvar: Condvar,
}

type RowKey = (TableOid, RecordId);

/// Wait-for graph rebuilt by the detector on every tick, together with the
/// resource each waiter is parked on so its condition variable can be
/// signalled. Everything here is cleared at the end of each tick.
#[derive(Debug, Default)]
struct WaitsForGraph {
    edges: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    txn_waits_on_table: HashMap<TransactionId, TableOid>,
    txn_waits_on_row: HashMap<TransactionId, RowKey>,
}

#[derive(Debug)]
struct LockManagerInner {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockResource>>>,
    row_lock_map: Mutex<HashMap<RowKey, Arc<LockResource>>>,
    waits_for: Mutex<WaitsForGraph>,
    transactions: DashMap<TransactionId, Arc<Transaction>>,
    shutdown: AtomicBool,
    config: LockManagerConfig,
}

/// Hierarchical two-level lock manager with multi-mode locks, single-slot
/// upgrades, isolation-level policy, and a background deadlock detector.
///
/// Rule violations abort the transaction: its state is set to `Aborted`
/// first, then a typed [`PetraError::TransactionAbort`] is returned. A
/// waiting request cancelled by the detector (or any external abort)
/// returns `Ok(false)`; the caller owns the actual transaction teardown.
#[derive(Debug)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::new_with_config(LockManagerConfig::default())
    }

    pub fn new_with_config(config: LockManagerConfig) -> Self {
        let inner = Arc::new(LockManagerInner {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(WaitsForGraph::default()),
            transactions: DashMap::new(),
            shutdown: AtomicBool::new(false),
            config,
        });
        let detector_inner = inner.clone();
        let detector = thread::Builder::new()
            .name("deadlock-detector".to_string())
            .spawn(move || {
                while !detector_inner.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(detector_inner.config.cycle_detection_interval);
                    if detector_inner.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    detector_inner.run_detection_pass();
                }
            })
            .expect("Failed to spawn deadlock detector thread");
        Self {
            inner,
            detector: Mutex::new(Some(detector)),
        }
    }

    /// Acquire a table-level lock. Ok(true) on grant, Ok(false) when the
    /// wait was cancelled because the transaction was aborted (deadlock
    /// victim or external abort).
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> PetraResult<bool> {
        self.check_admission(txn, mode, false)?;
        let resource = self.table_resource(oid);
        self.lock_resource(txn, mode, oid, None, resource)
    }

    /// Acquire a row-level lock. Rows accept only S and X, and require the
    /// matching table-level lock to be held first.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> PetraResult<bool> {
        self.check_admission(txn, mode, true)?;
        match mode {
            LockMode::Exclusive => {
                let table_mode = txn.held_table_mode(oid);
                if !matches!(
                    table_mode,
                    Some(LockMode::Exclusive)
                        | Some(LockMode::IntentionExclusive)
                        | Some(LockMode::SharedIntentionExclusive)
                ) {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            LockMode::Shared => {
                if txn.held_table_mode(oid).is_none() {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            _ => unreachable!("intention modes rejected by admission check"),
        }
        let resource = self.row_resource(oid, rid);
        self.lock_resource(txn, mode, oid, Some(rid), resource)
    }

    /// Release a table lock. Requires every row lock on the table to be
    /// released first; transitions the transaction to Shrinking per its
    /// isolation level.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> PetraResult<bool> {
        let resource = self.inner.table_lock_map.lock().get(&oid).cloned();
        let Some(resource) = resource else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        let mut queue = resource.queue.lock();
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(queue);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = queue.requests.remove(pos).expect("position is valid");
        resource.condvar.notify_all();
        drop(queue);

        self.transition_on_release(txn, request.mode);
        txn.erase_table_lock(request.mode, oid);
        Ok(true)
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
    ) -> PetraResult<bool> {
        let resource = self.inner.row_lock_map.lock().get(&(oid, rid)).cloned();
        let Some(resource) = resource else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mut queue = resource.queue.lock();
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(queue);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = queue.requests.remove(pos).expect("position is valid");
        resource.condvar.notify_all();
        drop(queue);

        self.transition_on_release(txn, request.mode);
        txn.erase_row_lock(request.mode, oid, rid);
        Ok(true)
    }

    /// Test hook: directly add a wait-for edge.
    pub fn add_edge(&self, from: TransactionId, to: TransactionId) {
        self.inner
            .waits_for
            .lock()
            .edges
            .entry(from)
            .or_default()
            .insert(to);
    }

    /// Test hook: remove a wait-for edge.
    pub fn remove_edge(&self, from: TransactionId, to: TransactionId) {
        let mut graph = self.inner.waits_for.lock();
        if let Some(targets) = graph.edges.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                graph.edges.remove(&from);
            }
        }
    }

    /// Snapshot of the current wait-for edges.
    pub fn edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        let graph = self.inner.waits_for.lock();
        graph
            .edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (*from, *to)))
            .collect()
    }

    fn table_resource(&self, oid: TableOid) -> Arc<LockResource> {
        self.inner
            .table_lock_map
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(LockResource::default()))
            .clone()
    }

    fn row_resource(&self, oid: TableOid, rid: RecordId) -> Arc<LockResource> {
        self.inner
            .row_lock_map
            .lock()
            .entry((oid, rid))
            .or_insert_with(|| Arc::new(LockResource::default()))
            .clone()
    }

    /// Isolation-level and 2PL-phase policy for a new lock request.
    fn check_admission(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        is_row: bool,
    ) -> PetraResult<()> {
        use LockMode::*;
        if is_row
            && matches!(
                mode,
                IntentionShared | IntentionExclusive | SharedIntentionExclusive
            )
        {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(PetraError::Internal(format!(
                    "transaction {} is no longer active",
                    txn.id()
                )));
            }
            TransactionState::Shrinking => match txn.isolation_level() {
                IsolationLevel::RepeatableRead => {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
                IsolationLevel::ReadCommitted => {
                    if !matches!(mode, Shared | IntentionShared) {
                        return Err(self.abort(txn, AbortReason::LockOnShrinking));
                    }
                }
                IsolationLevel::ReadUncommitted => {
                    if matches!(mode, Exclusive | IntentionExclusive) {
                        return Err(self.abort(txn, AbortReason::LockOnShrinking));
                    }
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
            },
            TransactionState::Growing => {
                if txn.isolation_level() == IsolationLevel::ReadUncommitted
                    && matches!(mode, Shared | IntentionShared | SharedIntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
            }
        }
        Ok(())
    }

    fn lock_resource(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<RecordId>,
        resource: Arc<LockResource>,
    ) -> PetraResult<bool> {
        self.inner.transactions.insert(txn.id(), txn.clone());

        let mut queue = resource.queue.lock();
        if let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            if queue.requests[pos].mode == mode {
                // repeated identical request is idempotent
                return Ok(true);
            }
            if queue.upgrading != INVALID_TRANSACTION_ID {
                drop(queue);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            let held = queue.requests[pos].mode;
            if !can_upgrade(held, mode) {
                drop(queue);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            // drop the old grant and queue the upgrade ahead of every
            // pending request but behind all grants
            let old = queue.requests.remove(pos).expect("position is valid");
            match old.rid {
                Some(rid) => txn.erase_row_lock(old.mode, old.oid, rid),
                None => txn.erase_table_lock(old.mode, old.oid),
            }
            let insert_at = queue
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(queue.requests.len());
            queue.requests.insert(
                insert_at,
                LockRequest {
                    txn_id: txn.id(),
                    mode,
                    oid,
                    rid,
                    granted: false,
                },
            );
            queue.upgrading = txn.id();
        } else {
            queue.requests.push_back(LockRequest {
                txn_id: txn.id(),
                mode,
                oid,
                rid,
                granted: false,
            });
        }

        loop {
            if Self::can_grant(&queue, txn.id()) {
                let request = queue
                    .requests
                    .iter_mut()
                    .find(|r| r.txn_id == txn.id())
                    .expect("request still queued");
                request.granted = true;
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TRANSACTION_ID;
                }
                debug!(
                    "lock granted: txn={} oid={} rid={:?} mode={:?}",
                    txn.id(),
                    oid,
                    rid,
                    mode
                );
                match rid {
                    Some(rid) => txn.record_row_lock(mode, oid, rid),
                    None => txn.record_table_lock(mode, oid),
                }
                drop(queue);
                if mode != LockMode::Exclusive {
                    // compatible followers may proceed
                    resource.condvar.notify_all();
                }
                return Ok(true);
            }

            resource.condvar.wait(&mut queue);
            // wakeups may be spurious; re-examine the abort flag every time
            if txn.state() == TransactionState::Aborted {
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TRANSACTION_ID;
                }
                queue.requests.retain(|r| r.txn_id != txn.id());
                resource.condvar.notify_all();
                return Ok(false);
            }
        }
    }

    /// A request is grantable iff it is compatible with every granted
    /// request and with every pending request queued ahead of it; the one
    /// in-flight upgrade skips the pending check.
    fn can_grant(queue: &LockRequestQueue, txn_id: TransactionId) -> bool {
        let pos = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id)
            .expect("request must be queued");
        let me = &queue.requests[pos];
        let is_upgrade = queue.upgrading == txn_id;
        for (i, other) in queue.requests.iter().enumerate() {
            if other.txn_id == txn_id {
                continue;
            }
            if other.granted {
                if !are_modes_compatible(me.mode, other.mode) {
                    return false;
                }
            } else if i < pos && !is_upgrade && !are_modes_compatible(me.mode, other.mode) {
                return false;
            }
        }
        true
    }

    fn transition_on_release(&self, txn: &Arc<Transaction>, mode: LockMode) {
        let ends_growing = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                matches!(mode, LockMode::Exclusive)
            }
        };
        if ends_growing
            && !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            )
        {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    /// Set the transaction to Aborted, then hand back the typed error, so
    /// concurrent operations on the same transaction observe the abort
    /// without consulting the lock manager.
    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> PetraError {
        txn.set_state(TransactionState::Aborted);
        PetraError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

impl LockManagerInner {
    /// One detector tick: rebuild the wait-for graph from both lock maps,
    /// abort the youngest transaction of every cycle, wake its waiters,
    /// and clear the graph and waiter maps for the next tick.
    fn run_detection_pass(&self) {
        let table_resources: Vec<(TableOid, Arc<LockResource>)> = self
            .table_lock_map
            .lock()
            .iter()
            .map(|(oid, resource)| (*oid, resource.clone()))
            .collect();
        let row_resources: Vec<(RowKey, Arc<LockResource>)> = self
            .row_lock_map
            .lock()
            .iter()
            .map(|(key, resource)| (*key, resource.clone()))
            .collect();

        {
            let mut graph = self.waits_for.lock();
            for (oid, resource) in &table_resources {
                let queue = resource.queue.lock();
                for waiting in queue.requests.iter().filter(|r| !r.granted) {
                    graph.txn_waits_on_table.insert(waiting.txn_id, *oid);
                    for granted in queue.requests.iter().filter(|r| r.granted) {
                        if granted.txn_id != waiting.txn_id
                            && !are_modes_compatible(waiting.mode, granted.mode)
                        {
                            graph
                                .edges
                                .entry(waiting.txn_id)
                                .or_default()
                                .insert(granted.txn_id);
                        }
                    }
                }
            }
            for (key, resource) in &row_resources {
                let queue = resource.queue.lock();
                for waiting in queue.requests.iter().filter(|r| !r.granted) {
                    graph.txn_waits_on_row.insert(waiting.txn_id, *key);
                    for granted in queue.requests.iter().filter(|r| r.granted) {
                        if granted.txn_id != waiting.txn_id
                            && !are_modes_compatible(waiting.mode, granted.mode)
                        {
                            graph
                                .edges
                                .entry(waiting.txn_id)
                                .or_default()
                                .insert(granted.txn_id);
                        }
                    }
                }
            }
        }

        loop {
            let victim = {
                let graph = self.waits_for.lock();
                Self::find_cycle_victim(&graph.edges)
            };
            let Some(victim) = victim else {
                break;
            };
            warn!("deadlock detected, aborting txn {}", victim);
            if let Some(txn) = self.transactions.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }

            let (waits_table, waits_row) = {
                let mut graph = self.waits_for.lock();
                graph.edges.remove(&victim);
                for targets in graph.edges.values_mut() {
                    targets.remove(&victim);
                }
                (
                    graph.txn_waits_on_table.get(&victim).copied(),
                    graph.txn_waits_on_row.get(&victim).copied(),
                )
            };
            if let Some(oid) = waits_table {
                if let Some(resource) = self.table_lock_map.lock().get(&oid).cloned() {
                    resource.condvar.notify_all();
                }
            }
            if let Some(key) = waits_row {
                if let Some(resource) = self.row_lock_map.lock().get(&key).cloned() {
                    resource.condvar.notify_all();
                }
            }
        }

        let mut graph = self.waits_for.lock();
        graph.edges.clear();
        graph.txn_waits_on_table.clear();
        graph.txn_waits_on_row.clear();
    }

    /// DFS from every node in ascending txn-id order; the victim is the
    /// largest (youngest) transaction id on the first cycle found.
    fn find_cycle_victim(
        edges: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    ) -> Option<TransactionId> {
        fn dfs(
            edges: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
            node: TransactionId,
            path: &mut Vec<TransactionId>,
            on_path: &mut HashSet<TransactionId>,
        ) -> Option<Vec<TransactionId>> {
            if on_path.contains(&node) {
                let pos = path.iter().position(|t| *t == node).expect("node on path");
                return Some(path[pos..].to_vec());
            }
            path.push(node);
            on_path.insert(node);
            if let Some(targets) = edges.get(&node) {
                for &next in targets {
                    if let Some(cycle) = dfs(edges, next, path, on_path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            on_path.remove(&node);
            None
        }

        for &start in edges.keys() {
            let mut path = vec![];
            let mut on_path = HashSet::new();
            if let Some(cycle) = dfs(edges, start, &mut path, &mut on_path) {
                return cycle.into_iter().max();
            }
        }
        None
    }
}
