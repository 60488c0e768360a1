//! Configuration-selected admission strategy.
//!
//! The policy is a small closed set of behaviors chosen once per partition from the
//! immutable speculation config; there is no runtime-pluggable dispatch.

use kst_common::config::SpeculationConfig;

/// How far into the queue admission may look for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionScan {
    /// Consider only the queue head; an unsafe head means true idle.
    HeadOnly,
    /// Scan forward past unsafe candidates. The scan cursor never moves backward, so
    /// ledger order still equals arrival order among admitted transactions.
    Forward,
}

/// Immutable admission strategy for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    enabled: bool,
    only_when_idle: bool,
    ignore_all_local: bool,
    use_model: bool,
}

impl AdmissionPolicy {
    /// Derives the policy from the partition's speculation config.
    #[must_use]
    pub fn new(config: &SpeculationConfig) -> Self {
        Self {
            enabled: config.enabled,
            only_when_idle: config.only_when_idle,
            ignore_all_local: config.ignore_all_local,
            use_model: config.use_model,
        }
    }

    /// Returns whether any candidate can possibly be admitted under this policy.
    ///
    /// With every predictor disabled there is no admission path and the partition
    /// falls back to never-speculate.
    #[must_use]
    pub fn speculation_possible(&self) -> bool {
        self.enabled && (self.use_model || self.ignore_all_local)
    }

    /// Returns the queue-scan strategy.
    #[must_use]
    pub fn scan(&self) -> AdmissionScan {
        if self.only_when_idle {
            AdmissionScan::HeadOnly
        } else {
            AdmissionScan::Forward
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdmissionPolicy, AdmissionScan};
    use googletest::prelude::*;
    use kst_common::config::SpeculationConfig;
    use rstest::rstest;

    #[rstest]
    fn disabled_master_switch_blocks_all_admission() {
        let policy = AdmissionPolicy::new(&SpeculationConfig {
            enabled: false,
            ..SpeculationConfig::default()
        });
        assert_that!(policy.speculation_possible(), eq(false));
    }

    #[rstest]
    fn all_predictors_disabled_falls_back_to_never_speculate() {
        let policy = AdmissionPolicy::new(&SpeculationConfig {
            use_model: false,
            ignore_all_local: false,
            ..SpeculationConfig::default()
        });
        assert_that!(policy.speculation_possible(), eq(false));
    }

    #[rstest]
    #[case(true, AdmissionScan::HeadOnly)]
    #[case(false, AdmissionScan::Forward)]
    fn scan_strategy_follows_only_when_idle(
        #[case] only_when_idle: bool,
        #[case] expected: AdmissionScan,
    ) {
        let policy = AdmissionPolicy::new(&SpeculationConfig {
            only_when_idle,
            ..SpeculationConfig::default()
        });
        assert_that!(policy.scan(), eq(expected));
    }
}
