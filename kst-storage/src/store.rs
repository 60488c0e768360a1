//! Partition-store trait and the in-memory reference implementation.

use hashbrown::HashMap;

use kst_common::error::KstResult;
use kst_common::ids::PartitionId;

use crate::ops::{ExecResult, StoreOp};
use crate::undo::{UndoOp, UndoRecord};

/// Keyspace slice owned by one partition's serial executor.
///
/// The scheduling core invokes this boundary synchronously on the partition's worker
/// thread, so implementations need no internal locking.
pub trait PartitionStore: Send {
    /// Returns the owner partition id.
    fn partition_id(&self) -> PartitionId;

    /// Executes one transaction's operations and returns the result together with the
    /// undo record reverting its writes.
    ///
    /// # Errors
    ///
    /// Returns an error when the operations cannot be applied. Implementations must not
    /// leave partial writes behind on failure.
    fn execute(&mut self, ops: &[StoreOp]) -> KstResult<(ExecResult, UndoRecord)>;

    /// Reverts one transaction's writes.
    ///
    /// # Errors
    ///
    /// Returns an error when the undo record cannot be applied cleanly. This is fatal
    /// to the partition's consistency and the caller must stop scheduling on it.
    fn apply_undo(&mut self, undo: UndoRecord) -> KstResult<()>;
}

type TableRows = HashMap<Vec<u8>, Vec<u8>>;

/// In-memory keyspace used by the engine runtime and tests.
#[derive(Debug, Default)]
pub struct InMemoryPartitionStore {
    partition: PartitionId,
    tables: HashMap<String, TableRows>,
}

impl InMemoryPartitionStore {
    /// Creates an empty store owned by one partition.
    #[must_use]
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            tables: HashMap::new(),
        }
    }

    /// Returns one row's current value.
    #[must_use]
    pub fn row(&self, table: &str, key: &[u8]) -> Option<&Vec<u8>> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }

    /// Returns the full partition state as a sorted list for state diffing in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Vec<u8>, Vec<u8>)> {
        let mut rows = Vec::new();
        for (table, table_rows) in &self.tables {
            for (key, value) in table_rows {
                rows.push((table.clone(), key.clone(), value.clone()));
            }
        }
        rows.sort();
        rows
    }
}

impl PartitionStore for InMemoryPartitionStore {
    fn partition_id(&self) -> PartitionId {
        self.partition
    }

    fn execute(&mut self, ops: &[StoreOp]) -> KstResult<(ExecResult, UndoRecord)> {
        let mut result = ExecResult::default();
        let mut undo = UndoRecord::default();

        for op in ops {
            match op {
                StoreOp::Read { table, key } => {
                    let value = self
                        .tables
                        .get(table)
                        .and_then(|rows| rows.get(key))
                        .cloned();
                    result.outputs.push(value);
                }
                StoreOp::Write { table, key, value } => {
                    let rows = self.tables.entry(table.clone()).or_default();
                    match rows.insert(key.clone(), value.clone()) {
                        Some(previous) => undo.push(UndoOp::Restore {
                            table: table.clone(),
                            key: key.clone(),
                            value: previous,
                        }),
                        None => undo.push(UndoOp::Remove {
                            table: table.clone(),
                            key: key.clone(),
                        }),
                    }
                    result.outputs.push(None);
                }
                StoreOp::Delete { table, key } => {
                    if let Some(rows) = self.tables.get_mut(table)
                        && let Some(previous) = rows.remove(key)
                    {
                        undo.push(UndoOp::Restore {
                            table: table.clone(),
                            key: key.clone(),
                            value: previous,
                        });
                    }
                    result.outputs.push(None);
                }
            }
        }

        Ok((result, undo))
    }

    fn apply_undo(&mut self, undo: UndoRecord) -> KstResult<()> {
        // Inverses are recorded in execution order, so replay walks them backwards.
        for inverse in undo.ops().iter().rev() {
            match inverse {
                UndoOp::Restore { table, key, value } => {
                    let rows = self.tables.entry(table.clone()).or_default();
                    let _ = rows.insert(key.clone(), value.clone());
                }
                UndoOp::Remove { table, key } => {
                    if let Some(rows) = self.tables.get_mut(table) {
                        let _ = rows.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}
