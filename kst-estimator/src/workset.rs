//! Partition-local work sets and conflict rules.

use hashbrown::HashSet;

use kst_model::graph::{AccessMode, TableTouch, TouchScope};
use kst_storage::ops::StoreOp;

/// Tables one transaction reads and writes at a single partition.
///
/// Conflict granularity is the partition-local table: two transactions conflict when
/// their sets intersect on a table with a write on either side. Read/read overlap is
/// never a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSet {
    reads: HashSet<String>,
    writes: HashSet<String>,
}

impl WorkSet {
    /// Creates an empty work set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the actual work set of an executed (or about-to-execute) operation list.
    #[must_use]
    pub fn from_ops(ops: &[StoreOp]) -> Self {
        let mut set = Self::new();
        for op in ops {
            if op.is_write() {
                set.add_write(op.table());
            } else {
                set.add_read(op.table());
            }
        }
        set
    }

    /// Builds the predicted work set of a single-partition candidate.
    ///
    /// A candidate runs entirely on its home partition, so every predicted touch is
    /// partition-local regardless of scope annotation.
    #[must_use]
    pub fn from_predicted_local<'a>(touches: impl IntoIterator<Item = &'a TableTouch>) -> Self {
        let mut set = Self::new();
        for touch in touches {
            set.add_touch(touch);
        }
        set
    }

    /// Builds the predicted work set of a distributed transaction as seen from one
    /// participating partition.
    ///
    /// Base-scoped touches land only on the transaction's base partition; remote-scoped
    /// touches land on every other participant.
    #[must_use]
    pub fn from_predicted_at<'a>(
        touches: impl IntoIterator<Item = &'a TableTouch>,
        at_base: bool,
    ) -> Self {
        let mut set = Self::new();
        for touch in touches {
            let lands_here = match touch.scope {
                TouchScope::Base => at_base,
                TouchScope::Remote => !at_base,
            };
            if lands_here {
                set.add_touch(touch);
            }
        }
        set
    }

    fn add_touch(&mut self, touch: &TableTouch) {
        match touch.mode {
            AccessMode::Read => self.add_read(&touch.table),
            AccessMode::Write => self.add_write(&touch.table),
        }
    }

    /// Records a read of one table.
    pub fn add_read(&mut self, table: &str) {
        if !self.writes.contains(table) {
            let _ = self.reads.insert(table.to_owned());
        }
    }

    /// Records a write of one table. A write subsumes an earlier read of the same table.
    pub fn add_write(&mut self, table: &str) {
        let _ = self.reads.remove(table);
        let _ = self.writes.insert(table.to_owned());
    }

    /// Merges another work set into this one.
    pub fn union_with(&mut self, other: &WorkSet) {
        for table in &other.reads {
            self.add_read(table);
        }
        for table in &other.writes {
            self.add_write(table);
        }
    }

    /// Returns whether the two work sets conflict under the write-overlap rule.
    #[must_use]
    pub fn conflicts_with(&self, other: &WorkSet) -> bool {
        self.writes.iter().any(|table| {
            other.writes.contains(table) || other.reads.contains(table)
        }) || self
            .reads
            .iter()
            .any(|table| other.writes.contains(table))
    }

    /// Returns whether the work set records no touches at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}
