//! Serialized model artifacts and validated loading.
//!
//! An artifact is a JSON document produced by the offline training pipeline. Loading
//! validates graph shape and probability mass once; after that the model is immutable.

use std::path::Path;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use kst_common::error::{KstError, KstResult};

use crate::graph::{PathEdge, PathModel, ProcedureGraph, StateId, TableTouch};

/// Allowed deviation of a checkpoint's outgoing probability mass from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// One table touch as serialized in the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchArtifact {
    /// Table name from the partitioning catalog.
    pub table: String,
    /// Access intent (`read` / `write`).
    pub mode: crate::graph::AccessMode,
    /// Partition scope (`base` / `remote`).
    pub scope: crate::graph::TouchScope,
}

/// One outgoing transition as serialized in the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeArtifact {
    /// Destination checkpoint id.
    pub to: StateId,
    /// Transition probability.
    pub probability: f64,
    /// Predicted touches along this transition.
    #[serde(default)]
    pub touches: Vec<TouchArtifact>,
}

/// One checkpoint as serialized in the artifact. No edges means terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateArtifact {
    /// Checkpoint id, unique within the procedure.
    pub id: StateId,
    /// Outgoing transitions.
    #[serde(default)]
    pub edges: Vec<EdgeArtifact>,
}

/// One procedure graph as serialized in the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureArtifact {
    /// Procedure name as submitted at the invocation boundary.
    pub name: String,
    /// Initial checkpoint id.
    pub start: StateId,
    /// All checkpoints of this procedure.
    pub states: Vec<StateArtifact>,
}

/// Top-level artifact document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Per-procedure graphs.
    pub procedures: Vec<ProcedureArtifact>,
}

/// Loads and validates a model artifact from a file path.
///
/// # Errors
///
/// Returns `KstError::Io` when the file cannot be read and `KstError::Model` when the
/// document is malformed or violates a graph invariant.
pub fn load_model(path: &Path) -> KstResult<PathModel> {
    let text = std::fs::read_to_string(path).map_err(|error| KstError::Io(error.to_string()))?;
    let model = parse_model(&text)?;
    tracing::info!(
        path = %path.display(),
        procedures = model.procedure_count(),
        "transaction-path model loaded"
    );
    Ok(model)
}

/// Parses and validates a model artifact from its JSON text.
///
/// # Errors
///
/// Returns `KstError::Model` when the document is malformed or violates a graph invariant.
pub fn parse_model(text: &str) -> KstResult<PathModel> {
    let artifact: ModelArtifact =
        serde_json::from_str(text).map_err(|error| KstError::Model(error.to_string()))?;
    build_model(artifact)
}

/// Builds a validated [`PathModel`] from an in-memory artifact.
///
/// # Errors
///
/// Returns `KstError::Model` when a procedure name or checkpoint id repeats, an edge
/// targets a missing checkpoint, a probability is outside `(0, 1]`, or a non-terminal
/// checkpoint's probability mass deviates from 1 beyond [`PROBABILITY_TOLERANCE`].
pub fn build_model(artifact: ModelArtifact) -> KstResult<PathModel> {
    let mut procedures = HashMap::new();
    for procedure in artifact.procedures {
        let graph = build_procedure(&procedure)?;
        if procedures.insert(procedure.name.clone(), graph).is_some() {
            return Err(KstError::Model(format!(
                "duplicate procedure `{}` in model artifact",
                procedure.name
            )));
        }
    }
    Ok(PathModel::new(procedures))
}

fn build_procedure(procedure: &ProcedureArtifact) -> KstResult<ProcedureGraph> {
    let mut states: HashMap<StateId, Vec<PathEdge>> = HashMap::new();
    for state in &procedure.states {
        let edges = state
            .edges
            .iter()
            .map(|edge| PathEdge {
                to: edge.to,
                probability: edge.probability,
                touches: edge
                    .touches
                    .iter()
                    .map(|touch| TableTouch {
                        table: touch.table.clone(),
                        mode: touch.mode,
                        scope: touch.scope,
                    })
                    .collect(),
            })
            .collect();
        if states.insert(state.id, edges).is_some() {
            return Err(KstError::Model(format!(
                "procedure `{}` repeats checkpoint {}",
                procedure.name, state.id
            )));
        }
    }

    if !states.contains_key(&procedure.start) {
        return Err(KstError::Model(format!(
            "procedure `{}` start checkpoint {} is not defined",
            procedure.name, procedure.start
        )));
    }

    for state in &procedure.states {
        if state.edges.is_empty() {
            continue;
        }
        let mut mass = 0.0_f64;
        for edge in &state.edges {
            if !states.contains_key(&edge.to) {
                return Err(KstError::Model(format!(
                    "procedure `{}` checkpoint {} targets missing checkpoint {}",
                    procedure.name, state.id, edge.to
                )));
            }
            if edge.probability <= 0.0 || edge.probability > 1.0 {
                return Err(KstError::Model(format!(
                    "procedure `{}` checkpoint {} has out-of-range probability {}",
                    procedure.name, state.id, edge.probability
                )));
            }
            mass += edge.probability;
        }
        if (mass - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(KstError::Model(format!(
                "procedure `{}` checkpoint {} probability mass is {mass}, expected 1",
                procedure.name, state.id
            )));
        }
    }

    Ok(ProcedureGraph::new(procedure.start, states))
}
