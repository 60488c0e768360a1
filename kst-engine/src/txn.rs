//! Transaction requests, routed plans, and response frames.

use kst_common::error::KstResult;
use kst_common::ids::{PartitionId, TxnId};
use kst_storage::ops::{ExecResult, StoreOp};

/// One transaction as submitted at the procedure-invocation boundary.
///
/// A request carries the procedure name and bound parameters used for path prediction,
/// plus the concrete partition-store operations the execution engine derived for it,
/// grouped into ordered hops. Most transactions are a single hop; a distributed
/// procedure that ships work in waves uses one hop per wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRequest {
    /// Procedure name.
    pub procedure: String,
    /// Bound parameter values.
    pub params: Vec<Vec<u8>>,
    /// Store operations per hop, in execution order.
    pub hops: Vec<Vec<StoreOp>>,
}

impl TxnRequest {
    /// Creates a single-hop request.
    #[must_use]
    pub fn new(procedure: impl Into<String>, params: Vec<Vec<u8>>, ops: Vec<StoreOp>) -> Self {
        Self {
            procedure: procedure.into(),
            params,
            hops: vec![ops],
        }
    }

    /// Creates a multi-hop request.
    #[must_use]
    pub fn with_hops(
        procedure: impl Into<String>,
        params: Vec<Vec<u8>>,
        hops: Vec<Vec<StoreOp>>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            params,
            hops,
        }
    }
}

/// One execution hop with operations grouped by destination partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPlan {
    /// Operations grouped by owning partition, sorted by partition id.
    pub per_partition: Vec<(PartitionId, Vec<StoreOp>)>,
}

/// Fully routed execution plan produced by [`crate::routing::plan_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnPlan {
    /// Engine-assigned monotonic transaction id.
    pub txn_id: TxnId,
    /// Procedure name.
    pub procedure: String,
    /// Bound parameter values.
    pub params: Vec<Vec<u8>>,
    /// Ordered hop sequence.
    pub hops: Vec<HopPlan>,
    /// Full partition footprint, sorted and deduplicated.
    ///
    /// This set is authoritative for single-partition classification; the base
    /// partition of a distributed transaction is its lowest member.
    pub partitions: Vec<PartitionId>,
}

impl TxnPlan {
    /// Returns whether the plan touches exactly one partition.
    #[must_use]
    pub fn is_single_partition(&self) -> bool {
        self.partitions.len() == 1
    }

    /// Returns the plan's base partition.
    #[must_use]
    pub fn base_partition(&self) -> PartitionId {
        self.partitions.first().copied().unwrap_or(0)
    }

    /// Flattens all hops into one operation list for a given partition.
    #[must_use]
    pub fn ops_for(&self, partition: PartitionId) -> Vec<StoreOp> {
        let mut ops = Vec::new();
        for hop in &self.hops {
            for (owner, hop_ops) in &hop.per_partition {
                if *owner == partition {
                    ops.extend(hop_ops.iter().cloned());
                }
            }
        }
        ops
    }
}

/// Lifecycle state of one transaction inside a partition scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Waiting in the partition queue.
    Queued,
    /// Currently running on the partition executor.
    Executing,
    /// Executed speculatively; result buffered until the blocking transaction resolves.
    SpeculativeCommittedPending,
    /// Result externally visible.
    Committed,
    /// Discarded; the transaction either re-queued or reported an error.
    Aborted,
}

/// One response per transaction, delivered exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnResponse {
    /// Transaction the response belongs to.
    pub txn_id: TxnId,
    /// Opaque result payload or the client-visible failure.
    pub result: KstResult<ExecResult>,
    /// Whether the transaction touched exactly one partition.
    pub single_partition: bool,
    /// Whether the result was produced while its ledger entry was still unresolved.
    pub speculative: bool,
}
