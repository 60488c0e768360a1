//! Partition worker runtime: one thread and one queue per partition.
//!
//! The runtime mirrors the engine's shared-nothing execution boundary: each partition
//! owns a message queue and a dedicated worker thread running its scheduler. Between
//! messages a blocked worker keeps admitting speculative work, so "blocked" never
//! parks the thread while eligible candidates exist.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use hashbrown::HashMap;

use kst_common::config::EngineConfig;
use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionCount, PartitionId, TxnId};
use kst_model::graph::PathModel;
use kst_storage::ops::StoreOp;
use kst_storage::store::PartitionStore;

use crate::coordinator::CoordinatorMessage;
use crate::scheduler::{PartitionMode, PartitionScheduler, ResolveOutcome, SchedulerEvent};
use crate::txn::TxnResponse;

/// Unit of work sent to one partition worker.
#[derive(Debug)]
pub enum PartitionMessage {
    /// One single-partition transaction with its response channel.
    Single {
        /// Engine-assigned transaction id.
        txn_id: TxnId,
        /// Procedure name, consumed by prediction.
        procedure: String,
        /// Bound parameter values, consumed by prediction.
        params: Vec<Vec<u8>>,
        /// Partition-store operations.
        ops: Vec<StoreOp>,
        /// Whether partitioning metadata proves the transaction local.
        purely_local: bool,
        /// Channel receiving the single response.
        reply: Sender<TxnResponse>,
    },
    /// One fragment of a distributed transaction.
    Fragment {
        /// Owning distributed transaction.
        txn_id: TxnId,
        /// Procedure name of the distributed transaction.
        procedure: String,
        /// Bound parameter values of the distributed transaction.
        params: Vec<Vec<u8>>,
        /// Operations of this fragment at this partition.
        ops: Vec<StoreOp>,
        /// Whether this partition is the transaction's base partition.
        at_base: bool,
    },
    /// Final outcome of a distributed transaction this partition participated in.
    Resolve {
        /// Resolved transaction.
        txn_id: TxnId,
        /// Commit or abort, with the final work set on commit.
        outcome: ResolveOutcome,
    },
}

/// One worker thread per partition, fed through per-partition queues.
pub struct PartitionRuntime {
    partition_count: PartitionCount,
    senders: Vec<Sender<PartitionMessage>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for PartitionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRuntime")
            .field("partition_count", &self.partition_count)
            .field("senders", &self.senders.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl PartitionRuntime {
    /// Creates one runtime with one worker thread per partition.
    ///
    /// `store_factory` builds each partition's store, so tests can inject doubles the
    /// same way they inject custom stores into the scheduler directly.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition scheduler cannot be built from the config.
    pub fn new<S, F>(
        config: &EngineConfig,
        model: Option<Arc<PathModel>>,
        coordinator: Sender<CoordinatorMessage>,
        mut store_factory: F,
    ) -> KstResult<Self>
    where
        S: PartitionStore + 'static,
        F: FnMut(PartitionId) -> S,
    {
        let partition_count = config.partition_count;
        let partition_len = usize::from(partition_count.get());

        let mut senders = Vec::with_capacity(partition_len);
        let mut workers = Vec::with_capacity(partition_len);
        for partition in 0..partition_len {
            let partition_id = match PartitionId::try_from(partition) {
                Ok(partition_id) => partition_id,
                Err(_) => return Err(KstError::InvalidState("partition id overflows u16")),
            };
            let scheduler = PartitionScheduler::new(
                partition_id,
                config,
                store_factory(partition_id),
                model.clone(),
            )?;
            let (sender, receiver) = mpsc::channel::<PartitionMessage>();
            senders.push(sender);

            let worker_coordinator = coordinator.clone();
            let handle = thread::spawn(move || {
                partition_worker_loop(scheduler, &receiver, &worker_coordinator);
            });
            workers.push(handle);
        }

        Ok(Self {
            partition_count,
            senders,
            workers,
        })
    }

    /// Number of partition workers served by this runtime.
    #[must_use]
    pub fn partition_count(&self) -> PartitionCount {
        self.partition_count
    }

    /// Submits one message to a destination partition.
    ///
    /// # Errors
    ///
    /// Returns `KstError::InvalidState` when the target partition is out of range or
    /// its queue is closed.
    pub fn submit(&self, partition: PartitionId, message: PartitionMessage) -> KstResult<()> {
        let Some(sender) = self.senders.get(usize::from(partition)) else {
            return Err(KstError::InvalidState("target partition is out of range"));
        };
        sender
            .send(message)
            .map_err(|_| KstError::InvalidState("partition queue is closed"))
    }

    /// Returns sender handles for the coordinator's fragment/resolve dispatch.
    #[must_use]
    pub fn sender_handles(&self) -> Vec<Sender<PartitionMessage>> {
        self.senders.clone()
    }
}

impl Drop for PartitionRuntime {
    fn drop(&mut self) {
        // Close all producer handles first so worker loops can observe queue closure.
        self.senders.clear();

        // Join worker threads to avoid background tasks surviving beyond runtime scope.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn partition_worker_loop<S: PartitionStore>(
    mut scheduler: PartitionScheduler<S>,
    receiver: &Receiver<PartitionMessage>,
    coordinator: &Sender<CoordinatorMessage>,
) {
    let mut replies: HashMap<TxnId, Sender<TxnResponse>> = HashMap::new();
    loop {
        let message = match receiver.try_recv() {
            Ok(message) => message,
            Err(TryRecvError::Empty) => {
                // The executor would otherwise sit idle: admit speculative work while
                // blocked, re-checking the queue between admissions.
                if scheduler.mode() == PartitionMode::Blocked && scheduler.try_admit_next() {
                    continue;
                }
                match receiver.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        let events = match message {
            PartitionMessage::Single {
                txn_id,
                procedure,
                params,
                ops,
                purely_local,
                reply,
            } => {
                let _ = replies.insert(txn_id, reply);
                scheduler.submit_single(txn_id, procedure, params, ops, purely_local)
            }
            PartitionMessage::Fragment {
                txn_id,
                procedure,
                params,
                ops,
                at_base,
            } => scheduler.submit_fragment(txn_id, procedure, params, ops, at_base),
            PartitionMessage::Resolve { txn_id, outcome } => {
                scheduler.on_resolved(txn_id, outcome)
            }
        };
        dispatch_events(events, &mut replies, coordinator);
    }
}

fn dispatch_events(
    events: Vec<SchedulerEvent>,
    replies: &mut HashMap<TxnId, Sender<TxnResponse>>,
    coordinator: &Sender<CoordinatorMessage>,
) {
    for event in events {
        match event {
            SchedulerEvent::Respond { response } => {
                if let Some(reply) = replies.remove(&response.txn_id) {
                    // A departed caller is not an error for the partition.
                    let _ = reply.send(response);
                }
            }
            SchedulerEvent::FragmentExecuted {
                txn_id,
                partition,
                result,
            } => {
                let _ = coordinator.send(CoordinatorMessage::FragmentAck {
                    txn_id,
                    partition,
                    result,
                });
            }
        }
    }
}
