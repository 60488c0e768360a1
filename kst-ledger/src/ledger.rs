//! Speculative execution ledger with idempotent resolution sweeps.

use kst_common::error::{KstError, KstResult};
use kst_common::ids::{SequenceNumber, TxnId};
use kst_estimator::workset::WorkSet;
use kst_storage::ops::ExecResult;
use kst_storage::undo::UndoRecord;

/// One speculatively executed transaction awaiting resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// Resolution order, strictly increasing, assigned at admission time.
    pub sequence: SequenceNumber,
    /// Transaction the entry belongs to.
    pub txn_id: TxnId,
    /// Buffered execution result, released only by a commit sweep.
    pub result: ExecResult,
    /// Inverse operations reverting this transaction's writes.
    pub undo: UndoRecord,
    /// Tables the transaction actually touched, for retroactive conflict checks.
    pub work_set: WorkSet,
    /// Whether the entry has been made externally visible by a commit sweep.
    pub visible: bool,
}

/// Per-partition ordered ledger of speculative work.
///
/// Created when the partition enters blocked mode and emptied by exactly one
/// resolution sweep; a second sweep of either kind observes an empty ledger and is a
/// no-op, which makes both resolution calls idempotent.
#[derive(Debug, Default)]
pub struct SpeculativeLedger {
    entries: Vec<LedgerEntry>,
    next_sequence: SequenceNumber,
}

impl SpeculativeLedger {
    /// Creates an empty ledger whose first entry receives `first_sequence`.
    ///
    /// The scheduler seeds this with a partition-lifetime counter so sequence numbers
    /// stay strictly increasing across consecutive blocked windows.
    #[must_use]
    pub fn new(first_sequence: SequenceNumber) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: first_sequence,
        }
    }

    /// Appends one speculatively executed transaction and returns its sequence number.
    pub fn append(
        &mut self,
        txn_id: TxnId,
        result: ExecResult,
        undo: UndoRecord,
        work_set: WorkSet,
    ) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(LedgerEntry {
            sequence,
            txn_id,
            result,
            undo,
            work_set,
            visible: false,
        });
        sequence
    }

    /// Returns the sequence number the next appended entry would receive.
    #[must_use]
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Returns the number of unresolved entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the ledger holds no unresolved entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the unresolved entries in sequence order.
    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Returns the sequence of the earliest entry whose actual work set conflicts with
    /// `work_set`, if any.
    #[must_use]
    pub fn first_conflicting_sequence(&self, work_set: &WorkSet) -> Option<SequenceNumber> {
        self.entries
            .iter()
            .find(|entry| entry.work_set.conflicts_with(work_set))
            .map(|entry| entry.sequence)
    }

    /// Makes all entries externally visible and clears the ledger.
    ///
    /// Entries are returned in sequence order, which equals arrival order at the
    /// partition, so client-observed commit order is preserved.
    pub fn resolve_commit(&mut self) -> Vec<LedgerEntry> {
        let mut entries = std::mem::take(&mut self.entries);
        for entry in &mut entries {
            entry.visible = true;
        }
        if !entries.is_empty() {
            tracing::debug!(released = entries.len(), "speculative ledger commit sweep");
        }
        entries
    }

    /// Discards all entries, applying their undos in strict reverse sequence order.
    ///
    /// Later speculative transactions may have observed earlier speculative writes, so
    /// the unwind must run newest-first. Returns the discarded entries in sequence
    /// order for re-queueing.
    ///
    /// # Errors
    ///
    /// Returns `KstError::UndoFailure` when `apply` fails; the ledger is cleared
    /// regardless because the partition cannot continue scheduling after a failed undo.
    pub fn resolve_rollback<F>(&mut self, apply: F) -> KstResult<Vec<LedgerEntry>>
    where
        F: FnMut(UndoRecord) -> KstResult<()>,
    {
        let first = match self.entries.first() {
            Some(entry) => entry.sequence,
            None => return Ok(Vec::new()),
        };
        self.rollback_from(first, apply)
    }

    /// Discards the suffix of entries with `sequence >= from`, applying their undos in
    /// strict reverse sequence order. Returns the discarded entries in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `KstError::UndoFailure` when `apply` fails; the affected suffix is
    /// removed from the ledger regardless.
    pub fn rollback_from<F>(
        &mut self,
        from: SequenceNumber,
        mut apply: F,
    ) -> KstResult<Vec<LedgerEntry>>
    where
        F: FnMut(UndoRecord) -> KstResult<()>,
    {
        let split = self
            .entries
            .iter()
            .position(|entry| entry.sequence >= from)
            .unwrap_or(self.entries.len());
        let suffix = self.entries.split_off(split);

        let mut failure: Option<KstError> = None;
        for entry in suffix.iter().rev() {
            if let Err(error) = apply(entry.undo.clone()) {
                failure = Some(KstError::UndoFailure(format!(
                    "transaction {} sequence {}: {error}",
                    entry.txn_id, entry.sequence
                )));
                break;
            }
        }
        if !suffix.is_empty() {
            tracing::debug!(
                discarded = suffix.len(),
                from_sequence = from,
                "speculative ledger rollback sweep"
            );
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(suffix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SpeculativeLedger;
    use googletest::prelude::*;
    use kst_estimator::workset::WorkSet;
    use kst_storage::ops::ExecResult;
    use kst_storage::undo::{UndoOp, UndoRecord};
    use rstest::rstest;

    fn writes(table: &str) -> WorkSet {
        let mut set = WorkSet::new();
        set.add_write(table);
        set
    }

    fn undo_marker(tag: &[u8]) -> UndoRecord {
        let mut undo = UndoRecord::default();
        undo.push(UndoOp::Remove {
            table: "t".to_owned(),
            key: tag.to_vec(),
        });
        undo
    }

    #[rstest]
    fn append_assigns_strictly_increasing_sequences() {
        let mut ledger = SpeculativeLedger::new(10);
        let first = ledger.append(100, ExecResult::default(), UndoRecord::default(), writes("a"));
        let second = ledger.append(101, ExecResult::default(), UndoRecord::default(), writes("b"));

        assert_that!(first, eq(10_u64));
        assert_that!(second, eq(11_u64));
        assert_that!(ledger.next_sequence(), eq(12_u64));
    }

    #[rstest]
    fn commit_sweep_releases_entries_in_sequence_order_and_marks_visible() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), UndoRecord::default(), writes("a"));
        let _ = ledger.append(2, ExecResult::default(), UndoRecord::default(), writes("b"));

        let released = ledger.resolve_commit();
        let ids = released.iter().map(|entry| entry.txn_id).collect::<Vec<_>>();
        assert_that!(&ids, eq(&vec![1_u64, 2_u64]));
        assert_that!(released.iter().all(|entry| entry.visible), eq(true));
        assert_that!(ledger.is_empty(), eq(true));
    }

    #[rstest]
    fn commit_sweep_is_idempotent() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), UndoRecord::default(), writes("a"));

        assert_that!(ledger.resolve_commit().len(), eq(1_usize));
        assert_that!(ledger.resolve_commit().len(), eq(0_usize));
    }

    #[rstest]
    fn rollback_applies_undos_in_reverse_sequence_order() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), undo_marker(b"first"), writes("a"));
        let _ = ledger.append(2, ExecResult::default(), undo_marker(b"second"), writes("b"));

        let mut applied = Vec::new();
        let discarded = ledger
            .resolve_rollback(|undo| {
                applied.push(undo.ops()[0].clone());
                Ok(())
            })
            .expect("rollback must succeed");

        let order = applied
            .iter()
            .map(|op| match op {
                UndoOp::Remove { key, .. } => key.clone(),
                UndoOp::Restore { key, .. } => key.clone(),
            })
            .collect::<Vec<_>>();
        assert_that!(&order, eq(&vec![b"second".to_vec(), b"first".to_vec()]));

        let ids = discarded.iter().map(|entry| entry.txn_id).collect::<Vec<_>>();
        assert_that!(&ids, eq(&vec![1_u64, 2_u64]));
        assert_that!(ledger.is_empty(), eq(true));
    }

    #[rstest]
    fn rollback_is_idempotent() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), UndoRecord::default(), writes("a"));

        let first = ledger
            .resolve_rollback(|_| Ok(()))
            .expect("rollback must succeed");
        let second = ledger
            .resolve_rollback(|_| Ok(()))
            .expect("second rollback must be a no-op");
        assert_that!(first.len(), eq(1_usize));
        assert_that!(second.len(), eq(0_usize));
    }

    #[rstest]
    fn suffix_rollback_keeps_the_clean_prefix() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), UndoRecord::default(), writes("a"));
        let conflicting =
            ledger.append(2, ExecResult::default(), UndoRecord::default(), writes("hot"));
        let _ = ledger.append(3, ExecResult::default(), UndoRecord::default(), writes("c"));

        let found = ledger.first_conflicting_sequence(&writes("hot"));
        assert_that!(found, eq(Some(conflicting)));

        let discarded = ledger
            .rollback_from(conflicting, |_| Ok(()))
            .expect("suffix rollback must succeed");
        let ids = discarded.iter().map(|entry| entry.txn_id).collect::<Vec<_>>();
        assert_that!(&ids, eq(&vec![2_u64, 3_u64]));
        assert_that!(ledger.len(), eq(1_usize));
        assert_that!(ledger.entries()[0].txn_id, eq(1_u64));
    }

    #[rstest]
    fn rollback_surfaces_undo_failure_and_still_clears() {
        let mut ledger = SpeculativeLedger::new(0);
        let _ = ledger.append(1, ExecResult::default(), undo_marker(b"x"), writes("a"));

        let result = ledger.resolve_rollback(|_| {
            Err(kst_common::error::KstError::Storage("disk gone".to_owned()))
        });
        assert_that!(
            matches!(result, Err(kst_common::error::KstError::UndoFailure(_))),
            eq(true)
        );
        assert_that!(ledger.is_empty(), eq(true));
    }
}
