//! Process-wide workflow settings: the plan override and the graph blueprint.
//!
//! Both are copied into a run when its plan is resolved, so later edits only
//! affect runs started afterwards.

use std::sync::{Arc, PoisonError, RwLock};

use conductor_common::GraphBlueprint;

use crate::errors::PlanError;
use crate::stages::StageKind;

#[derive(Clone, Default)]
pub struct WorkflowStore {
    plan_override: Arc<RwLock<Option<Vec<StageKind>>>>,
    graph: Arc<RwLock<Option<GraphBlueprint>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_override(&self) -> Option<Vec<StageKind>> {
        self.plan_override
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the plan override. Blank entries are dropped; the rest must
    /// name distinct pipeline stages.
    pub fn set_plan_override(&self, steps: &[String]) -> Result<Vec<StageKind>, PlanError> {
        let kinds = parse_stage_list(steps)?;
        *self
            .plan_override
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(kinds.clone());
        Ok(kinds)
    }

    pub fn clear_plan_override(&self) {
        *self
            .plan_override
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The operator-supplied graph, if any.
    pub fn custom_graph(&self) -> Option<GraphBlueprint> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The graph shown to observers: the custom graph, else a linear layout
    /// of the default plan.
    pub fn graph(&self) -> GraphBlueprint {
        self.custom_graph().unwrap_or_else(|| {
            GraphBlueprint::linear(
                StageKind::PIPELINE
                    .iter()
                    .map(|k| (k.as_str(), k.requires_selection())),
            )
        })
    }

    pub fn set_graph(&self, graph: GraphBlueprint) -> GraphBlueprint {
        *self.graph.write().unwrap_or_else(PoisonError::into_inner) = Some(graph.clone());
        graph
    }
}

/// Parse stage names into distinct pipeline stages.
pub fn parse_stage_list(steps: &[String]) -> Result<Vec<StageKind>, PlanError> {
    let mut kinds: Vec<StageKind> = Vec::new();
    for step in steps.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let kind: StageKind = step.parse()?;
        if !kind.is_pipeline_stage() {
            return Err(PlanError::UnknownStage {
                name: step.to_string(),
            });
        }
        if kinds.contains(&kind) {
            return Err(PlanError::DuplicateStage {
                name: kind.as_str().to_string(),
            });
        }
        kinds.push(kind);
    }
    if kinds.is_empty() {
        return Err(PlanError::Empty);
    }
    Ok(kinds)
}
