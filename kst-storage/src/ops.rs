//! Partition-store operation frames.

/// One partition-local operation produced by the execution engine for a transaction.
///
/// Keys and values are raw bytes preserving the wire-level payload; the scheduling core
/// routes and forwards them without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Reads one row.
    Read {
        /// Target table.
        table: String,
        /// Row key bytes.
        key: Vec<u8>,
    },
    /// Writes one row, creating or replacing it.
    Write {
        /// Target table.
        table: String,
        /// Row key bytes.
        key: Vec<u8>,
        /// New row value.
        value: Vec<u8>,
    },
    /// Deletes one row if present.
    Delete {
        /// Target table.
        table: String,
        /// Row key bytes.
        key: Vec<u8>,
    },
}

impl StoreOp {
    /// Returns the target table name.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Read { table, .. } | Self::Write { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    /// Returns the target row key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Read { key, .. } | Self::Write { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    /// Returns whether this operation mutates partition state.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Delete { .. })
    }
}

/// Opaque execution result forwarded to the caller.
///
/// One output slot per executed operation: reads yield the stored value (or `None` for
/// a missing row), mutations yield `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Per-operation outputs in execution order.
    pub outputs: Vec<Option<Vec<u8>>>,
}
