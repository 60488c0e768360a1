//! Partition routing over row keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use kst_common::error::{KstError, KstResult};
use kst_common::ids::{PartitionCount, PartitionId, TxnId};

use crate::txn::{HopPlan, TxnPlan, TxnRequest};

/// Resolves row-key ownership to a partition id.
pub trait PartitionRouter: Send + Sync {
    /// Returns the owner partition for the given key bytes.
    fn partition_for_key(&self, key: &[u8]) -> PartitionId;
}

/// Deterministic hash-based router standing in for the external partitioning catalog.
#[derive(Debug, Clone)]
pub struct HashPartitionRouter {
    partition_count: PartitionCount,
}

impl HashPartitionRouter {
    /// Builds a router for a specific partition count.
    #[must_use]
    pub fn new(partition_count: PartitionCount) -> Self {
        Self { partition_count }
    }
}

impl PartitionRouter for HashPartitionRouter {
    fn partition_for_key(&self, key: &[u8]) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partition = hasher.finish() % u64::from(self.partition_count.get());
        match PartitionId::try_from(partition) {
            Ok(partition_id) => partition_id,
            Err(_) => unreachable!("modulo partition_count ensures partition id fits into u16"),
        }
    }
}

/// Routes one request into an execution plan.
///
/// Every hop's operations are grouped by owning partition with operation order
/// preserved inside each group; the plan's partition footprint is the sorted union
/// across hops.
///
/// # Errors
///
/// Returns `KstError::InvalidState` when the request carries no hops or no operations
/// at all.
pub fn plan_transaction(
    router: &dyn PartitionRouter,
    txn_id: TxnId,
    request: TxnRequest,
) -> KstResult<TxnPlan> {
    if request.hops.is_empty() {
        return Err(KstError::InvalidState(
            "transaction must contain at least one hop",
        ));
    }
    if request.hops.iter().all(Vec::is_empty) {
        return Err(KstError::InvalidState(
            "transaction must contain at least one operation",
        ));
    }

    let mut partitions = Vec::new();
    let mut hops = Vec::new();
    for hop_ops in &request.hops {
        let mut per_partition: Vec<(PartitionId, Vec<kst_storage::ops::StoreOp>)> = Vec::new();
        for op in hop_ops {
            let owner = router.partition_for_key(op.key());
            match per_partition.iter_mut().find(|(partition, _)| *partition == owner) {
                Some((_, ops)) => ops.push(op.clone()),
                None => per_partition.push((owner, vec![op.clone()])),
            }
        }
        per_partition.sort_by_key(|(partition, _)| *partition);
        for (partition, _) in &per_partition {
            if !partitions.contains(partition) {
                partitions.push(*partition);
            }
        }
        hops.push(HopPlan { per_partition });
    }
    partitions.sort_unstable();

    Ok(TxnPlan {
        txn_id,
        procedure: request.procedure,
        params: request.params,
        hops,
        partitions,
    })
}
