//! Distributed-transaction coordination.
//!
//! The coordinator runs on its own thread and talks to partitions exclusively by
//! message: it ships fragments hop by hop, tracks the partitions it has not yet heard
//! back from, and resolves every participant (commit or abort) exactly once. Upstream
//! cancellation arrives as a `Cancel` message and is handled as an abort outcome.

use std::sync::mpsc::{Receiver, Sender};
use std::thread;

use hashbrown::{HashMap, HashSet};

use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionId, TxnId};
use kst_estimator::workset::WorkSet;
use kst_storage::ops::ExecResult;

use crate::runtime::PartitionMessage;
use crate::scheduler::ResolveOutcome;
use crate::txn::{TxnPlan, TxnResponse};

/// Messages accepted by the coordinator thread.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Start one distributed transaction.
    Begin {
        /// Routed multi-partition plan.
        plan: TxnPlan,
        /// Channel receiving the single client response.
        reply: Sender<TxnResponse>,
    },
    /// Abort one in-flight transaction (upstream cancellation or timeout).
    Cancel {
        /// Transaction to abort.
        txn_id: TxnId,
        /// Abort cause reported to participants and the client.
        reason: String,
    },
    /// One partition finished one fragment.
    FragmentAck {
        /// Owning transaction.
        txn_id: TxnId,
        /// Reporting partition.
        partition: PartitionId,
        /// Fragment result.
        result: KstResult<ExecResult>,
    },
    /// Abort all in-flight transactions and exit.
    ///
    /// The coordinator and the partition workers hold channel handles to each other,
    /// so engine teardown breaks the cycle with this explicit message instead of
    /// relying on sender disconnection alone.
    Shutdown,
}

struct InFlightTxn {
    plan: TxnPlan,
    reply: Sender<TxnResponse>,
    current_hop: usize,
    /// Partitions the transaction has not yet heard back from for the current hop.
    outstanding: HashSet<PartitionId>,
    /// Partitions that received at least one fragment and therefore need resolution.
    participants: HashSet<PartitionId>,
    /// Buffered results for the current hop, folded in partition order at the barrier.
    hop_results: Vec<(PartitionId, ExecResult)>,
    /// Accumulated outputs across completed hops.
    outputs: Vec<Option<Vec<u8>>>,
    failure: Option<KstError>,
}

/// Spawns the coordinator worker thread.
#[must_use]
pub fn spawn_coordinator(
    receiver: Receiver<CoordinatorMessage>,
    partitions: Vec<Sender<PartitionMessage>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || coordinator_loop(&receiver, &partitions))
}

fn coordinator_loop(
    receiver: &Receiver<CoordinatorMessage>,
    partitions: &[Sender<PartitionMessage>],
) {
    let mut in_flight: HashMap<TxnId, InFlightTxn> = HashMap::new();

    while let Ok(message) = receiver.recv() {
        match message {
            CoordinatorMessage::Begin { plan, reply } => {
                let txn_id = plan.txn_id;
                let mut txn = InFlightTxn {
                    plan,
                    reply,
                    current_hop: 0,
                    outstanding: HashSet::new(),
                    participants: HashSet::new(),
                    hop_results: Vec::new(),
                    outputs: Vec::new(),
                    failure: None,
                };
                tracing::debug!(
                    txn = txn_id,
                    partitions = ?txn.plan.partitions,
                    "distributed transaction dispatched"
                );
                dispatch_hop(&mut txn, partitions);
                if txn.outstanding.is_empty() {
                    // Every fragment send failed; nothing will ack, resolve now.
                    resolve(txn, partitions);
                } else {
                    let _ = in_flight.insert(txn_id, txn);
                }
            }
            CoordinatorMessage::Cancel { txn_id, reason } => {
                if let Some(mut txn) = in_flight.remove(&txn_id) {
                    txn.failure = Some(KstError::Aborted(txn_id, reason));
                    resolve(txn, partitions);
                } else {
                    tracing::debug!(txn = txn_id, "cancel for unknown transaction ignored");
                }
            }
            CoordinatorMessage::Shutdown => {
                for (txn_id, mut txn) in in_flight.drain() {
                    txn.failure = Some(KstError::Aborted(txn_id, "engine shutdown".to_owned()));
                    resolve(txn, partitions);
                }
                break;
            }
            CoordinatorMessage::FragmentAck {
                txn_id,
                partition,
                result,
            } => {
                let Some(txn) = in_flight.get_mut(&txn_id) else {
                    // Late ack of an already-resolved (for example cancelled) txn.
                    tracing::debug!(txn = txn_id, partition, "stray fragment ack ignored");
                    continue;
                };
                if !txn.outstanding.remove(&partition) {
                    tracing::debug!(txn = txn_id, partition, "duplicate fragment ack ignored");
                    continue;
                }
                match result {
                    Ok(result) => txn.hop_results.push((partition, result)),
                    Err(error) => txn.failure = Some(error),
                }
                if !txn.outstanding.is_empty() {
                    continue;
                }

                // Hop barrier reached: fold results deterministically by partition.
                let Some(mut txn) = in_flight.remove(&txn_id) else {
                    continue;
                };
                txn.hop_results.sort_by_key(|(partition, _)| *partition);
                for (_, result) in txn.hop_results.drain(..) {
                    txn.outputs.extend(result.outputs);
                }

                let has_more_hops = txn.current_hop + 1 < txn.plan.hops.len();
                if txn.failure.is_none() && has_more_hops {
                    txn.current_hop += 1;
                    dispatch_hop(&mut txn, partitions);
                    if txn.outstanding.is_empty() {
                        resolve(txn, partitions);
                    } else {
                        let _ = in_flight.insert(txn_id, txn);
                    }
                } else {
                    resolve(txn, partitions);
                }
            }
        }
    }
}

fn dispatch_hop(txn: &mut InFlightTxn, partitions: &[Sender<PartitionMessage>]) {
    let base_partition = txn.plan.base_partition();
    let hop = txn.plan.hops[txn.current_hop].clone();
    for (partition, ops) in hop.per_partition {
        let Some(sender) = partitions.get(usize::from(partition)) else {
            txn.failure = Some(KstError::InvalidState("target partition is out of range"));
            continue;
        };
        let message = PartitionMessage::Fragment {
            txn_id: txn.plan.txn_id,
            procedure: txn.plan.procedure.clone(),
            params: txn.plan.params.clone(),
            ops,
            at_base: partition == base_partition,
        };
        if sender.send(message).is_err() {
            txn.failure = Some(KstError::InvalidState("partition queue is closed"));
            continue;
        }
        let _ = txn.outstanding.insert(partition);
        let _ = txn.participants.insert(partition);
    }
}

/// Resolves every participant exactly once and delivers the client response.
fn resolve(txn: InFlightTxn, partitions: &[Sender<PartitionMessage>]) {
    let txn_id = txn.plan.txn_id;
    let mut participants = txn.participants.into_iter().collect::<Vec<_>>();
    participants.sort_unstable();

    match txn.failure {
        None => {
            for partition in participants {
                // The full work set at each partition is known only now; partitions
                // use it to detect speculative entries admitted on a misprediction.
                let final_work_set = WorkSet::from_ops(&txn.plan.ops_for(partition));
                if let Some(sender) = partitions.get(usize::from(partition)) {
                    let _ = sender.send(PartitionMessage::Resolve {
                        txn_id,
                        outcome: ResolveOutcome::Commit { final_work_set },
                    });
                }
            }
            tracing::info!(txn = txn_id, "distributed transaction committed");
            let _ = txn.reply.send(TxnResponse {
                txn_id,
                result: Ok(ExecResult {
                    outputs: txn.outputs,
                }),
                single_partition: false,
                speculative: false,
            });
        }
        Some(error) => {
            let reason = error.to_string();
            for partition in participants {
                if let Some(sender) = partitions.get(usize::from(partition)) {
                    let _ = sender.send(PartitionMessage::Resolve {
                        txn_id,
                        outcome: ResolveOutcome::Abort {
                            reason: reason.clone(),
                        },
                    });
                }
            }
            tracing::warn!(txn = txn_id, %error, "distributed transaction aborted");
            let _ = txn.reply.send(TxnResponse {
                txn_id,
                result: Err(KstError::Aborted(txn_id, reason)),
                single_partition: false,
                speculative: false,
            });
        }
    }
}
