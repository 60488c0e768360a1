//! Safe-to-speculate verdicts backed by the transaction-path model.

use std::sync::Arc;

use kst_common::config::SpeculationConfig;
use kst_common::error::KstResult;
use kst_common::ids::{PartitionId, TxnId};
use kst_model::cache::{parameter_fingerprint, PathCache};
use kst_model::graph::{PathEstimate, PathModel, StateId};

use crate::workset::WorkSet;

/// Candidate view handed to the estimator by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Transaction id, for logging only.
    pub txn_id: TxnId,
    /// Procedure name at the invocation boundary.
    pub procedure: &'a str,
    /// Bound parameter values.
    pub params: &'a [Vec<u8>],
    /// Whether partitioning metadata proves every operation lands on the home partition.
    pub purely_local: bool,
}

/// The blocking distributed transaction as known at one partition.
#[derive(Debug, Clone)]
pub struct BlockingContext {
    /// Blocking transaction id.
    pub txn_id: TxnId,
    /// Procedure name of the blocking transaction.
    pub procedure: String,
    /// Bound parameter values of the blocking transaction.
    pub params: Vec<Vec<u8>>,
    /// Whether this partition is the transaction's base partition.
    pub at_base: bool,
    /// Work already received from the blocking transaction at this partition.
    pub known: WorkSet,
    /// Model checkpoint the blocking transaction is predicted to be at, when the
    /// scheduler tracks one. `None` predicts from the procedure's initial checkpoint.
    pub checkpoint: Option<StateId>,
}

/// Boolean-with-confidence verdict for one admission decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Whether speculating the candidate is predicted safe.
    pub safe: bool,
    /// Confidence in the prediction, in `(0, 1]`.
    pub confidence: f64,
}

impl Verdict {
    fn certain(safe: bool) -> Self {
        Self {
            safe,
            confidence: 1.0,
        }
    }
}

/// Instrumentation counters captured when profiling is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimatorProfile {
    /// Total admission decisions that consulted prediction.
    pub consultations: u64,
    /// Path-cache hits.
    pub cache_hits: u64,
    /// Path-cache misses.
    pub cache_misses: u64,
    /// Candidates admitted through the ignore-all-local bypass.
    pub local_bypasses: u64,
    /// Decisions that predicted a conflict.
    pub unsafe_verdicts: u64,
}

/// Per-partition conflict estimator.
///
/// Invoked synchronously on the owning partition's worker thread; the path cache is
/// partition-local while the model itself is shared read-only.
#[derive(Debug)]
pub struct ConflictEstimator {
    partition: PartitionId,
    ignore_all_local: bool,
    use_model: bool,
    fast_path: bool,
    profiling: bool,
    model: Option<Arc<PathModel>>,
    cache: Option<PathCache>,
    profile: EstimatorProfile,
    conservative: bool,
}

impl ConflictEstimator {
    /// Creates an estimator for one partition from the immutable speculation config.
    ///
    /// # Errors
    ///
    /// Returns `KstError::InvalidConfig` when path caching is enabled with a zero
    /// cache capacity.
    pub fn new(
        partition: PartitionId,
        config: &SpeculationConfig,
        model: Option<Arc<PathModel>>,
    ) -> KstResult<Self> {
        let cache = if config.use_model && config.path_caching {
            Some(PathCache::new(config.path_cache_capacity)?)
        } else {
            None
        };
        Ok(Self {
            partition,
            ignore_all_local: config.ignore_all_local,
            use_model: config.use_model,
            fast_path: config.fast_path,
            profiling: config.profiling,
            model,
            cache,
            profile: EstimatorProfile::default(),
            conservative: false,
        })
    }

    /// Decides whether one candidate is safe to run while `blocking` is unresolved.
    ///
    /// The conservative default answers unsafe whenever no prediction is possible;
    /// only the explicit ignore-all-local override lets provably-local candidates
    /// bypass estimation entirely.
    pub fn is_safe(&mut self, candidate: &Candidate<'_>, blocking: &BlockingContext) -> Verdict {
        if self.conservative {
            return Verdict::certain(false);
        }

        if self.ignore_all_local && candidate.purely_local {
            if self.profiling {
                self.profile.local_bypasses += 1;
            }
            return Verdict::certain(true);
        }

        if self.profiling {
            self.profile.consultations += 1;
        }

        if !self.use_model {
            return self.record_unsafe();
        }

        let Some(candidate_estimate) = self.predict(candidate.procedure, candidate.params, None)
        else {
            // Unknown procedure: no prediction possible, fall back to conservative.
            return self.record_unsafe();
        };
        let candidate_set = WorkSet::from_predicted_local(&candidate_estimate.touches);
        let mut confidence = candidate_estimate.confidence;

        let mut blocking_set = blocking.known.clone();
        if let Some(blocking_estimate) =
            self.predict(&blocking.procedure, &blocking.params, blocking.checkpoint)
        {
            blocking_set.union_with(&WorkSet::from_predicted_at(
                &blocking_estimate.touches,
                blocking.at_base,
            ));
            confidence *= blocking_estimate.confidence;
        }

        if candidate_set.conflicts_with(&blocking_set) {
            let verdict = self.record_unsafe();
            return Verdict {
                safe: verdict.safe,
                confidence,
            };
        }
        Verdict {
            safe: true,
            confidence,
        }
    }

    /// Switches this partition's future admission decisions to conservative mode.
    ///
    /// Called by the scheduler when an internal estimator/ledger error must not be
    /// silently swallowed.
    pub fn downgrade(&mut self, reason: &'static str) {
        if !self.conservative {
            tracing::warn!(
                partition = self.partition,
                reason,
                "estimator downgraded to conservative admission"
            );
        }
        self.conservative = true;
    }

    /// Returns whether the estimator has been downgraded to conservative mode.
    #[must_use]
    pub fn is_conservative(&self) -> bool {
        self.conservative
    }

    /// Returns the profiling counters, when profiling is enabled.
    #[must_use]
    pub fn profile(&self) -> Option<EstimatorProfile> {
        self.profiling.then_some(self.profile)
    }

    fn record_unsafe(&mut self) -> Verdict {
        if self.profiling {
            self.profile.unsafe_verdicts += 1;
        }
        Verdict::certain(false)
    }

    /// Produces a path estimate for one procedure invocation.
    ///
    /// Traversals from the initial checkpoint are cached by parameter fingerprint; a
    /// warm entry short-circuits the graph walk only on the fast path. Mid-path
    /// checkpoints (the blocking transaction mid-execution) always re-walk because the
    /// cache key does not carry the checkpoint.
    fn predict(
        &mut self,
        procedure: &str,
        params: &[Vec<u8>],
        checkpoint: Option<StateId>,
    ) -> Option<PathEstimate> {
        let model = self.model.as_ref()?;
        let graph = model.procedure(procedure)?;

        if checkpoint.is_none()
            && let Some(cache) = self.cache.as_mut()
        {
            let fingerprint = parameter_fingerprint(params);
            if let Some(hit) = cache.get(procedure, fingerprint) {
                if self.profiling {
                    self.profile.cache_hits += 1;
                }
                if self.fast_path {
                    return Some(hit);
                }
            } else if self.profiling {
                self.profile.cache_misses += 1;
            }

            let estimate = graph.estimate()?;
            cache.insert(procedure, fingerprint, estimate.clone());
            return Some(estimate);
        }

        match checkpoint {
            Some(state) => graph.estimate_from(state),
            None => graph.estimate(),
        }
    }
}
