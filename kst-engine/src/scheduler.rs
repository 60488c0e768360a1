//! Per-partition speculative execution scheduler.
//!
//! The scheduler owns one partition's queue, ledger, estimator, and store handle, and
//! is invoked synchronously on the partition's worker thread. "Blocked" is a logical
//! state: the thread keeps running speculative work while the blocking distributed
//! transaction awaits its remote partitions.

use std::collections::VecDeque;
use std::sync::Arc;

use kst_common::config::EngineConfig;
use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionId, SequenceNumber, TxnId};
use kst_estimator::estimator::{BlockingContext, Candidate, ConflictEstimator};
use kst_estimator::workset::WorkSet;
use kst_ledger::ledger::{LedgerEntry, SpeculativeLedger};
use kst_model::graph::PathModel;
use kst_storage::ops::{ExecResult, StoreOp};
use kst_storage::store::PartitionStore;
use kst_storage::undo::UndoRecord;

use crate::policy::{AdmissionPolicy, AdmissionScan};
use crate::txn::{TxnResponse, TxnState};

/// Output the scheduler hands back to the runtime for delivery.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A transaction response ready for its caller's channel.
    Respond {
        /// The response frame.
        response: TxnResponse,
    },
    /// A distributed-transaction fragment finished at this partition.
    FragmentExecuted {
        /// Owning distributed transaction.
        txn_id: TxnId,
        /// Reporting partition.
        partition: PartitionId,
        /// Fragment result forwarded to the coordinator.
        result: KstResult<ExecResult>,
    },
}

/// Final outcome of the blocking distributed transaction.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// The transaction committed everywhere.
    Commit {
        /// The transaction's full work set at this partition, known only now, used for
        /// retroactive misprediction detection.
        final_work_set: WorkSet,
    },
    /// The transaction aborted (including upstream cancellation and timeouts).
    Abort {
        /// Human-readable abort cause, reported by the coordinator.
        reason: String,
    },
}

/// Externally observable partition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// No blocking transaction; work executes immediately.
    Idle,
    /// Blocked on an unresolved distributed transaction; speculation may run.
    Blocked,
    /// A failed undo made partition state unrecoverable; all work is rejected.
    Failed,
}

#[derive(Debug)]
struct PendingSingle {
    txn_id: TxnId,
    procedure: String,
    params: Vec<Vec<u8>>,
    ops: Vec<StoreOp>,
    purely_local: bool,
    arrival: u64,
    state: TxnState,
    skipped: bool,
}

#[derive(Debug)]
struct PendingFragment {
    txn_id: TxnId,
    procedure: String,
    params: Vec<Vec<u8>>,
    ops: Vec<StoreOp>,
    at_base: bool,
    arrival: u64,
}

#[derive(Debug)]
enum QueuedWork {
    Single(PendingSingle),
    Fragment(PendingFragment),
}

impl QueuedWork {
    fn arrival(&self) -> u64 {
        match self {
            Self::Single(single) => single.arrival,
            Self::Fragment(fragment) => fragment.arrival,
        }
    }
}

#[derive(Debug)]
struct BlockedState {
    blocking: BlockingContext,
    ledger: SpeculativeLedger,
    /// Undo records of the blocking transaction's own fragments, in execution order.
    fragment_undos: Vec<UndoRecord>,
    /// Admitted speculative work retained for re-execution after a rollback sweep.
    admitted: Vec<(SequenceNumber, PendingSingle)>,
}

#[derive(Debug)]
enum ModeState {
    Idle,
    Blocked(BlockedState),
    Failed,
}

/// One partition's speculative scheduler.
pub struct PartitionScheduler<S: PartitionStore> {
    partition: PartitionId,
    policy: AdmissionPolicy,
    estimator: ConflictEstimator,
    store: S,
    queue: VecDeque<QueuedWork>,
    mode: ModeState,
    /// Partition-lifetime sequence counter seeding each new ledger, so resolution
    /// order stays strictly increasing across consecutive blocked windows.
    next_sequence: SequenceNumber,
    arrival_counter: u64,
}

impl<S: PartitionStore> PartitionScheduler<S> {
    /// Creates the scheduler for one partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the estimator cannot be built from the speculation config.
    pub fn new(
        partition: PartitionId,
        config: &EngineConfig,
        store: S,
        model: Option<Arc<PathModel>>,
    ) -> KstResult<Self> {
        Ok(Self {
            partition,
            policy: AdmissionPolicy::new(&config.speculation),
            estimator: ConflictEstimator::new(partition, &config.speculation, model)?,
            store,
            queue: VecDeque::new(),
            mode: ModeState::Idle,
            next_sequence: 0,
            arrival_counter: 0,
        })
    }

    /// Returns the current partition mode.
    #[must_use]
    pub fn mode(&self) -> PartitionMode {
        match self.mode {
            ModeState::Idle => PartitionMode::Idle,
            ModeState::Blocked(_) => PartitionMode::Blocked,
            ModeState::Failed => PartitionMode::Failed,
        }
    }

    /// Returns the number of queued (not yet executed) transactions.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns the number of unresolved speculative ledger entries.
    #[must_use]
    pub fn ledger_len(&self) -> usize {
        match &self.mode {
            ModeState::Blocked(state) => state.ledger.len(),
            _ => 0,
        }
    }

    /// Returns the partition store for state inspection.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the partition's conflict estimator.
    #[must_use]
    pub fn estimator(&self) -> &ConflictEstimator {
        &self.estimator
    }

    /// Accepts one single-partition transaction.
    ///
    /// Idle partitions execute immediately; blocked partitions queue the transaction
    /// for speculative admission or post-resolution execution.
    pub fn submit_single(
        &mut self,
        txn_id: TxnId,
        procedure: String,
        params: Vec<Vec<u8>>,
        ops: Vec<StoreOp>,
        purely_local: bool,
    ) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        if matches!(self.mode, ModeState::Failed) {
            events.push(self.failed_response(txn_id));
        } else if matches!(self.mode, ModeState::Blocked(_)) {
            let arrival = self.bump_arrival();
            self.queue.push_back(QueuedWork::Single(PendingSingle {
                txn_id,
                procedure,
                params,
                ops,
                purely_local,
                arrival,
                state: TxnState::Queued,
                skipped: false,
            }));
        } else {
            let response = self.execute_single_now(txn_id, &ops);
            events.push(SchedulerEvent::Respond { response });
        }
        events
    }

    /// Accepts one fragment of a distributed transaction.
    ///
    /// The first fragment of a new transaction transitions an idle partition to
    /// blocked mode with a fresh ledger. Later hops of the current blocker execute
    /// immediately (after unwinding any speculative entry they invalidate); a second
    /// distributed transaction queues behind the first and is never speculated past.
    pub fn submit_fragment(
        &mut self,
        txn_id: TxnId,
        procedure: String,
        params: Vec<Vec<u8>>,
        ops: Vec<StoreOp>,
        at_base: bool,
    ) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        if matches!(self.mode, ModeState::Failed) {
            events.push(SchedulerEvent::FragmentExecuted {
                txn_id,
                partition: self.partition,
                result: Err(KstError::PartitionFailed(self.partition)),
            });
            return events;
        }
        if matches!(self.mode, ModeState::Idle) {
            self.block_on_fragment(txn_id, procedure, params, ops, at_base, &mut events);
            return events;
        }

        let same_blocker =
            matches!(&self.mode, ModeState::Blocked(state) if state.blocking.txn_id == txn_id);
        if same_blocker {
            self.execute_blocker_hop(txn_id, &ops, &mut events);
        } else {
            let arrival = self.bump_arrival();
            self.queue.push_back(QueuedWork::Fragment(PendingFragment {
                txn_id,
                procedure,
                params,
                ops,
                at_base,
                arrival,
            }));
        }
        events
    }

    /// Attempts to admit one queued candidate speculatively.
    ///
    /// Invoked by the runtime whenever the executor would otherwise sit idle while
    /// blocked. Returns whether a candidate was admitted; `false` means the executor
    /// genuinely idles (queue starvation is not an error).
    pub fn try_admit_next(&mut self) -> bool {
        if !self.policy.speculation_possible() {
            return false;
        }
        if !matches!(self.mode, ModeState::Blocked(_)) {
            return false;
        }
        let ModeState::Blocked(mut state) = std::mem::replace(&mut self.mode, ModeState::Idle)
        else {
            unreachable!("mode checked above");
        };
        let admitted = self.admit_one(&mut state);
        self.mode = ModeState::Blocked(state);
        admitted
    }

    /// Applies the blocking transaction's final outcome and resolves the ledger.
    ///
    /// Resolution of a transaction that is not the current blocker (including a second
    /// call for the same transaction) is a no-op, which makes resolution idempotent.
    pub fn on_resolved(&mut self, txn_id: TxnId, outcome: ResolveOutcome) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        let matches_blocker =
            matches!(&self.mode, ModeState::Blocked(state) if state.blocking.txn_id == txn_id);
        if !matches_blocker {
            tracing::debug!(
                partition = self.partition,
                txn = txn_id,
                "ignoring resolution for inactive blocking transaction"
            );
            return events;
        }
        let ModeState::Blocked(mut state) = std::mem::replace(&mut self.mode, ModeState::Idle)
        else {
            unreachable!("mode checked above");
        };

        match outcome {
            ResolveOutcome::Commit { final_work_set } => {
                if let Some(sequence) = state.ledger.first_conflicting_sequence(&final_work_set) {
                    tracing::warn!(
                        partition = self.partition,
                        txn = txn_id,
                        from_sequence = sequence,
                        "misprediction detected at commit; unwinding speculative suffix"
                    );
                    match state
                        .ledger
                        .rollback_from(sequence, |undo| self.store.apply_undo(undo))
                    {
                        Ok(rolled) => self.requeue_rolled(&mut state, rolled),
                        Err(error) => {
                            self.fail_partition(error, state, &mut events);
                            return events;
                        }
                    }
                }
                for entry in state.ledger.resolve_commit() {
                    if let Some(position) = state
                        .admitted
                        .iter()
                        .position(|(sequence, _)| *sequence == entry.sequence)
                    {
                        let (_, mut single) = state.admitted.remove(position);
                        single.state = TxnState::Committed;
                        tracing::debug!(
                            partition = self.partition,
                            txn = single.txn_id,
                            state = ?single.state,
                            "speculative result released"
                        );
                    }
                    events.push(SchedulerEvent::Respond {
                        response: TxnResponse {
                            txn_id: entry.txn_id,
                            result: Ok(entry.result),
                            single_partition: true,
                            speculative: true,
                        },
                    });
                }
                tracing::info!(
                    partition = self.partition,
                    txn = txn_id,
                    "blocking transaction committed"
                );
            }
            ResolveOutcome::Abort { reason } => {
                match state
                    .ledger
                    .resolve_rollback(|undo| self.store.apply_undo(undo))
                {
                    Ok(rolled) => self.requeue_rolled(&mut state, rolled),
                    Err(error) => {
                        self.fail_partition(error, state, &mut events);
                        return events;
                    }
                }
                let fragment_undos = std::mem::take(&mut state.fragment_undos);
                for undo in fragment_undos.into_iter().rev() {
                    if let Err(error) = self.store.apply_undo(undo) {
                        self.fail_partition(
                            KstError::UndoFailure(error.to_string()),
                            state,
                            &mut events,
                        );
                        return events;
                    }
                }
                tracing::info!(
                    partition = self.partition,
                    txn = txn_id,
                    reason = %reason,
                    "blocking transaction aborted"
                );
            }
        }

        if let Some(profile) = self.estimator.profile() {
            tracing::debug!(
                partition = self.partition,
                ?profile,
                "estimator profile at window end"
            );
        }
        self.clear_skip_marks();
        self.drain_queue(&mut events);
        events
    }

    fn admit_one(&mut self, state: &mut BlockedState) -> bool {
        let limit = match self.policy.scan() {
            AdmissionScan::HeadOnly => self.queue.len().min(1),
            AdmissionScan::Forward => self.queue.len(),
        };
        let mut chosen = None;
        let mut index = 0;
        while index < limit {
            if matches!(self.queue[index], QueuedWork::Fragment(_)) {
                // Never speculate past a second unresolved distributed transaction.
                break;
            }
            let already_skipped =
                matches!(&self.queue[index], QueuedWork::Single(single) if single.skipped);
            if already_skipped {
                index += 1;
                continue;
            }
            let safe = {
                let QueuedWork::Single(single) = &self.queue[index] else {
                    unreachable!("fragment handled above");
                };
                let candidate = Candidate {
                    txn_id: single.txn_id,
                    procedure: &single.procedure,
                    params: &single.params,
                    purely_local: single.purely_local,
                };
                self.estimator.is_safe(&candidate, &state.blocking).safe
            };
            if safe {
                chosen = Some(index);
                break;
            }
            match self.policy.scan() {
                AdmissionScan::HeadOnly => return false,
                AdmissionScan::Forward => {
                    // The cursor never moves backward: a passed-over candidate stays
                    // ineligible for the rest of this blocked window so ledger order
                    // matches arrival order among admitted transactions.
                    if let QueuedWork::Single(single) = &mut self.queue[index] {
                        single.skipped = true;
                    }
                    index += 1;
                }
            }
        }

        let Some(index) = chosen else { return false };
        let Some(QueuedWork::Single(mut single)) = self.queue.remove(index) else {
            return false;
        };
        single.state = TxnState::Executing;
        tracing::debug!(
            partition = self.partition,
            txn = single.txn_id,
            state = ?single.state,
            "executing speculative candidate"
        );
        match self.store.execute(&single.ops) {
            Ok((result, undo)) => {
                let work_set = WorkSet::from_ops(&single.ops);
                single.state = TxnState::SpeculativeCommittedPending;
                let sequence = state.ledger.append(single.txn_id, result, undo, work_set);
                self.next_sequence = state.ledger.next_sequence();
                tracing::debug!(
                    partition = self.partition,
                    txn = single.txn_id,
                    sequence,
                    "admitted speculative transaction"
                );
                state.admitted.push((sequence, single));
                true
            }
            Err(error) => {
                // The store signalled a real conflict the model missed. Requeue for
                // normal re-execution after resolution and stop trusting predictions.
                tracing::warn!(
                    partition = self.partition,
                    txn = single.txn_id,
                    %error,
                    "speculative execution failed; requeueing for normal execution"
                );
                self.estimator.downgrade("speculative execution failed");
                single.state = TxnState::Queued;
                single.skipped = true;
                self.queue.insert(index, QueuedWork::Single(single));
                false
            }
        }
    }

    fn block_on_fragment(
        &mut self,
        txn_id: TxnId,
        procedure: String,
        params: Vec<Vec<u8>>,
        ops: Vec<StoreOp>,
        at_base: bool,
        events: &mut Vec<SchedulerEvent>,
    ) {
        let known = WorkSet::from_ops(&ops);
        let (result, fragment_undos) = match self.store.execute(&ops) {
            Ok((result, undo)) => (Ok(result), vec![undo]),
            Err(error) => (Err(error), Vec::new()),
        };
        self.mode = ModeState::Blocked(BlockedState {
            blocking: BlockingContext {
                txn_id,
                procedure,
                params,
                at_base,
                known,
                checkpoint: None,
            },
            ledger: SpeculativeLedger::new(self.next_sequence),
            fragment_undos,
            admitted: Vec::new(),
        });
        tracing::debug!(
            partition = self.partition,
            txn = txn_id,
            "partition blocked on distributed transaction"
        );
        events.push(SchedulerEvent::FragmentExecuted {
            txn_id,
            partition: self.partition,
            result,
        });
    }

    fn execute_blocker_hop(
        &mut self,
        txn_id: TxnId,
        ops: &[StoreOp],
        events: &mut Vec<SchedulerEvent>,
    ) {
        let ModeState::Blocked(mut state) = std::mem::replace(&mut self.mode, ModeState::Idle)
        else {
            unreachable!("caller verified blocked mode");
        };
        let hop_set = WorkSet::from_ops(ops);

        // The blocking transaction must not observe speculative writes: unwind every
        // speculative entry that touched what this hop is about to touch.
        if let Some(sequence) = state.ledger.first_conflicting_sequence(&hop_set) {
            tracing::warn!(
                partition = self.partition,
                txn = txn_id,
                from_sequence = sequence,
                "speculative suffix conflicts with blocking transaction hop; unwinding"
            );
            match state
                .ledger
                .rollback_from(sequence, |undo| self.store.apply_undo(undo))
            {
                Ok(rolled) => self.requeue_rolled(&mut state, rolled),
                Err(error) => {
                    self.fail_partition(error, state, events);
                    events.push(SchedulerEvent::FragmentExecuted {
                        txn_id,
                        partition: self.partition,
                        result: Err(KstError::PartitionFailed(self.partition)),
                    });
                    return;
                }
            }
        }

        let result = match self.store.execute(ops) {
            Ok((result, undo)) => {
                state.fragment_undos.push(undo);
                state.blocking.known.union_with(&hop_set);
                Ok(result)
            }
            Err(error) => Err(error),
        };
        events.push(SchedulerEvent::FragmentExecuted {
            txn_id,
            partition: self.partition,
            result,
        });
        self.mode = ModeState::Blocked(state);
    }

    /// Non-speculative execution: the result is externally visible immediately and the
    /// undo record is discarded because the transaction is already durable-committed.
    fn execute_single_now(&mut self, txn_id: TxnId, ops: &[StoreOp]) -> TxnResponse {
        match self.store.execute(ops) {
            Ok((result, _undo)) => TxnResponse {
                txn_id,
                result: Ok(result),
                single_partition: true,
                speculative: false,
            },
            Err(error) => TxnResponse {
                txn_id,
                result: Err(error),
                single_partition: true,
                speculative: false,
            },
        }
    }

    fn requeue_rolled(&mut self, state: &mut BlockedState, rolled: Vec<LedgerEntry>) {
        for entry in rolled {
            let Some(position) = state
                .admitted
                .iter()
                .position(|(sequence, _)| *sequence == entry.sequence)
            else {
                continue;
            };
            let (_, mut single) = state.admitted.remove(position);
            single.state = TxnState::Queued;
            single.skipped = true;
            tracing::debug!(
                partition = self.partition,
                txn = single.txn_id,
                state = ?single.state,
                "requeued rolled-back speculative transaction"
            );
            self.requeue_by_arrival(single);
        }
    }

    fn requeue_by_arrival(&mut self, single: PendingSingle) {
        let position = self
            .queue
            .iter()
            .position(|work| work.arrival() > single.arrival)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, QueuedWork::Single(single));
    }

    fn drain_queue(&mut self, events: &mut Vec<SchedulerEvent>) {
        while matches!(self.mode, ModeState::Idle) {
            let Some(work) = self.queue.pop_front() else {
                break;
            };
            match work {
                QueuedWork::Single(single) => {
                    let response = self.execute_single_now(single.txn_id, &single.ops);
                    events.push(SchedulerEvent::Respond { response });
                }
                QueuedWork::Fragment(fragment) => {
                    self.block_on_fragment(
                        fragment.txn_id,
                        fragment.procedure,
                        fragment.params,
                        fragment.ops,
                        fragment.at_base,
                        events,
                    );
                }
            }
        }
    }

    fn clear_skip_marks(&mut self) {
        for work in &mut self.queue {
            if let QueuedWork::Single(single) = work {
                single.skipped = false;
            }
        }
    }

    fn fail_partition(
        &mut self,
        error: KstError,
        state: BlockedState,
        events: &mut Vec<SchedulerEvent>,
    ) {
        tracing::error!(
            partition = self.partition,
            %error,
            "partition entered failed mode"
        );
        self.mode = ModeState::Failed;
        for (_, mut single) in state.admitted {
            single.state = TxnState::Aborted;
            tracing::debug!(
                partition = self.partition,
                txn = single.txn_id,
                state = ?single.state,
                "speculative result discarded"
            );
            events.push(self.failed_response(single.txn_id));
        }
        for work in std::mem::take(&mut self.queue) {
            match work {
                QueuedWork::Single(single) => events.push(self.failed_response(single.txn_id)),
                QueuedWork::Fragment(fragment) => {
                    events.push(SchedulerEvent::FragmentExecuted {
                        txn_id: fragment.txn_id,
                        partition: self.partition,
                        result: Err(KstError::PartitionFailed(self.partition)),
                    });
                }
            }
        }
    }

    fn failed_response(&self, txn_id: TxnId) -> SchedulerEvent {
        SchedulerEvent::Respond {
            response: TxnResponse {
                txn_id,
                result: Err(KstError::PartitionFailed(self.partition)),
                single_partition: true,
                speculative: false,
            },
        }
    }

    fn bump_arrival(&mut self) -> u64 {
        self.arrival_counter += 1;
        self.arrival_counter
    }
}
