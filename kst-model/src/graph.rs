//! Probabilistic path graphs and most-likely-path estimation.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

/// Execution-checkpoint identifier inside one procedure graph.
pub type StateId = u32;

/// Read/write intent of one predicted table touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Shared read access.
    Read,
    /// Exclusive write access.
    Write,
}

/// Where a predicted touch lands relative to the transaction's base partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TouchScope {
    /// The touch stays on the transaction's base partition.
    Base,
    /// The touch fans out to the transaction's remote partitions.
    Remote,
}

/// One predicted table touch along a graph edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableTouch {
    /// Table name from the partitioning catalog.
    pub table: String,
    /// Predicted access intent.
    pub mode: AccessMode,
    /// Predicted partition scope.
    pub scope: TouchScope,
}

/// One possible next checkpoint with its transition probability and predicted touches.
#[derive(Debug, Clone, PartialEq)]
pub struct PathEdge {
    /// Destination checkpoint.
    pub to: StateId,
    /// Transition probability out of the source checkpoint.
    pub probability: f64,
    /// Tables predicted to be touched along this transition.
    pub touches: Vec<TableTouch>,
}

/// Immutable per-procedure path graph.
///
/// Checkpoints with no outgoing edges are terminal. Outgoing probabilities of every
/// non-terminal checkpoint sum to 1 within [`crate::artifact::PROBABILITY_TOLERANCE`];
/// the artifact loader enforces this before a graph is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureGraph {
    start: StateId,
    states: HashMap<StateId, Vec<PathEdge>>,
}

/// Predicted work footprint produced by one path traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct PathEstimate {
    /// Predicted table touches along the most likely path, in traversal order.
    pub touches: Vec<TableTouch>,
    /// Product of the transition probabilities along the chosen path.
    pub confidence: f64,
}

impl ProcedureGraph {
    pub(crate) fn new(start: StateId, states: HashMap<StateId, Vec<PathEdge>>) -> Self {
        Self { start, states }
    }

    /// Returns the procedure's initial checkpoint.
    #[must_use]
    pub fn start(&self) -> StateId {
        self.start
    }

    /// Returns whether the graph contains the given checkpoint.
    #[must_use]
    pub fn contains(&self, state: StateId) -> bool {
        self.states.contains_key(&state)
    }

    /// Walks the most likely path from one checkpoint and accumulates predicted touches.
    ///
    /// The walk greedily follows the highest-probability edge out of every checkpoint
    /// until it reaches a terminal checkpoint or revisits one (loop edges are legal in
    /// trained models, so revisiting ends the walk instead of spinning). Returns `None`
    /// when the checkpoint is not part of this graph.
    #[must_use]
    pub fn estimate_from(&self, checkpoint: StateId) -> Option<PathEstimate> {
        if !self.states.contains_key(&checkpoint) {
            return None;
        }

        let mut visited = HashSet::new();
        let mut touches = Vec::new();
        let mut confidence = 1.0_f64;
        let mut current = checkpoint;

        while visited.insert(current) {
            let Some(edges) = self.states.get(&current) else {
                break;
            };
            let Some(best) = edges.iter().max_by(|left, right| {
                left.probability
                    .partial_cmp(&right.probability)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) else {
                break;
            };
            confidence *= best.probability;
            touches.extend(best.touches.iter().cloned());
            current = best.to;
        }

        Some(PathEstimate {
            touches,
            confidence,
        })
    }

    /// Walks the most likely path from the procedure's initial checkpoint.
    #[must_use]
    pub fn estimate(&self) -> Option<PathEstimate> {
        self.estimate_from(self.start)
    }
}

/// Read-only collection of procedure graphs loaded from one model artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathModel {
    procedures: HashMap<String, ProcedureGraph>,
}

impl PathModel {
    pub(crate) fn new(procedures: HashMap<String, ProcedureGraph>) -> Self {
        Self { procedures }
    }

    /// Returns the graph for one procedure, if the model was trained on it.
    #[must_use]
    pub fn procedure(&self, name: &str) -> Option<&ProcedureGraph> {
        self.procedures.get(name)
    }

    /// Returns the number of procedures covered by this model.
    #[must_use]
    pub fn procedure_count(&self) -> usize {
        self.procedures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessMode, PathEdge, ProcedureGraph, TableTouch, TouchScope};
    use googletest::prelude::*;
    use hashbrown::HashMap;
    use rstest::rstest;

    fn touch(table: &str, mode: AccessMode) -> TableTouch {
        TableTouch {
            table: table.to_owned(),
            mode,
            scope: TouchScope::Base,
        }
    }

    fn branching_graph() -> ProcedureGraph {
        let mut states = HashMap::new();
        states.insert(
            0,
            vec![
                PathEdge {
                    to: 1,
                    probability: 0.8,
                    touches: vec![touch("orders", AccessMode::Write)],
                },
                PathEdge {
                    to: 2,
                    probability: 0.2,
                    touches: vec![touch("audit", AccessMode::Write)],
                },
            ],
        );
        states.insert(
            1,
            vec![PathEdge {
                to: 3,
                probability: 1.0,
                touches: vec![touch("stock", AccessMode::Read)],
            }],
        );
        states.insert(2, Vec::new());
        states.insert(3, Vec::new());
        ProcedureGraph::new(0, states)
    }

    #[rstest]
    fn estimate_follows_most_likely_branch() {
        let graph = branching_graph();
        let estimate = graph.estimate().expect("start checkpoint must exist");

        let tables = estimate
            .touches
            .iter()
            .map(|touch| touch.table.as_str())
            .collect::<Vec<_>>();
        assert_that!(&tables, eq(&vec!["orders", "stock"]));
        assert_that!((estimate.confidence - 0.8).abs() < 1e-9, eq(true));
    }

    #[rstest]
    fn estimate_from_mid_path_checkpoint_skips_earlier_touches() {
        let graph = branching_graph();
        let estimate = graph
            .estimate_from(1)
            .expect("mid-path checkpoint must exist");

        let tables = estimate
            .touches
            .iter()
            .map(|touch| touch.table.as_str())
            .collect::<Vec<_>>();
        assert_that!(&tables, eq(&vec!["stock"]));
        assert_that!((estimate.confidence - 1.0).abs() < 1e-9, eq(true));
    }

    #[rstest]
    fn estimate_from_unknown_checkpoint_returns_none() {
        let graph = branching_graph();
        assert_that!(graph.estimate_from(99).is_none(), eq(true));
    }

    #[rstest]
    fn estimate_terminates_on_loop_edges() {
        let mut states = HashMap::new();
        states.insert(
            0,
            vec![PathEdge {
                to: 0,
                probability: 1.0,
                touches: vec![touch("retries", AccessMode::Write)],
            }],
        );
        let graph = ProcedureGraph::new(0, states);

        let estimate = graph.estimate().expect("start checkpoint must exist");
        assert_that!(estimate.touches.len(), eq(1_usize));
    }
}
