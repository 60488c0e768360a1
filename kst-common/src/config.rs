//! Engine configuration shared by partition bootstrap code.
//!
//! Both structures are built once at engine start and passed by reference into the
//! scheduler, estimator, and admission policy. There is no ambient mutable global state.

use std::path::PathBuf;

use crate::ids::PartitionCount;

/// Speculation and prediction knobs for one partition's scheduler.
///
/// The knobs are independent; any combination is a legal configuration. With every
/// predictor disabled (`use_model` off and `ignore_all_local` off) admission degrades
/// to never-speculate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculationConfig {
    /// Master switch for speculative admission.
    pub enabled: bool,
    /// Restrict admission to the queue head instead of scanning forward past
    /// unsafe candidates.
    pub only_when_idle: bool,
    /// Let candidates proven local by partitioning metadata bypass conflict
    /// estimation entirely.
    pub ignore_all_local: bool,
    /// Consult the transaction-path model for conflict prediction.
    pub use_model: bool,
    /// Instrument estimator calls with profiling counters.
    pub profiling: bool,
    /// Cache path traversals keyed by a parameter fingerprint.
    pub path_caching: bool,
    /// Serve warm cache entries without re-walking the path graph.
    pub fast_path: bool,
    /// Bound for the per-partition path cache.
    pub path_cache_capacity: usize,
    /// Location of the serialized transaction-path model artifact.
    ///
    /// Loaded once at engine start and never mutated. `None` means no model is
    /// available and prediction falls back to the conservative default.
    pub model_path: Option<PathBuf>,
}

impl SpeculationConfig {
    /// Returns whether any admission path can possibly speculate under this configuration.
    #[must_use]
    pub fn predictors_enabled(&self) -> bool {
        self.enabled && (self.use_model || self.ignore_all_local)
    }
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            only_when_idle: true,
            ignore_all_local: false,
            use_model: true,
            profiling: false,
            path_caching: true,
            fast_path: true,
            path_cache_capacity: 1024,
            model_path: None,
        }
    }
}

/// Bootstrap configuration used by the engine facade during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of data partitions, each served by one serial executor.
    pub partition_count: PartitionCount,
    /// Speculation knobs applied to every partition scheduler.
    pub speculation: SpeculationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_count: PartitionCount::new(2).expect("literal partition count must be non-zero"),
            speculation: SpeculationConfig::default(),
        }
    }
}
