//! Undo records capturing the inverse of a transaction's writes.

/// One inverse operation restoring pre-transaction row state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOp {
    /// Put back the previous value of a row.
    Restore {
        /// Target table.
        table: String,
        /// Row key bytes.
        key: Vec<u8>,
        /// Value the row held before the transaction.
        value: Vec<u8>,
    },
    /// Remove a row the transaction created.
    Remove {
        /// Target table.
        table: String,
        /// Row key bytes.
        key: Vec<u8>,
    },
}

/// Minimal state needed to reverse one transaction's effects on partition state.
///
/// Inverses are recorded in execution order; [`crate::store::PartitionStore::apply_undo`]
/// replays them in reverse so intra-transaction overwrites unwind correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoRecord {
    inverses: Vec<UndoOp>,
}

impl UndoRecord {
    /// Records one inverse operation.
    pub fn push(&mut self, op: UndoOp) {
        self.inverses.push(op);
    }

    /// Returns the recorded inverses in execution order.
    #[must_use]
    pub fn ops(&self) -> &[UndoOp] {
        &self.inverses
    }

    /// Returns whether the transaction performed no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }
}
