//! Ordered record of speculatively executed transactions pending resolution.

pub mod ledger;
