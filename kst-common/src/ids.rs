//! Canonical identifier types used across scheduler, model, ledger, and storage.

/// Numeric partition identifier inside a single engine process.
pub type PartitionId = u16;

/// Monotonic transaction identifier allocated by the engine facade.
pub type TxnId = u64;

/// Speculative-ledger sequence number.
///
/// Assigned at admission time and strictly increasing for the lifetime of one partition,
/// so resolution order is authoritative across consecutive blocked windows.
pub type SequenceNumber = u64;

/// Strongly typed partition-count wrapper to avoid passing raw integers around engine APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u16);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero because the engine always requires at least one
    /// data partition with its own serial executor.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}
