//! Plans: the ordered stages a run walks, and how they are chosen.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_common::{GraphBlueprint, WorkflowStep};
use serde::Deserialize;

use crate::errors::PlanError;
use crate::stages::llm::UpstreamReply;
use crate::stages::{Stage, StageCatalog, StageKind, prompts};
use crate::workflow::WorkflowStore;

#[derive(Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub handler: Arc<dyn Stage>,
    pub requires_selection: bool,
    pub notes: String,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Stage>, requires_selection: bool) -> Self {
        Self {
            name: name.into(),
            handler,
            requires_selection,
            notes: String::new(),
        }
    }
}

impl fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("requires_selection", &self.requires_selection)
            .finish_non_exhaustive()
    }
}

/// A validated, non-empty sequence of uniquely named stages.
#[derive(Clone, Debug)]
pub struct Plan {
    stages: Vec<StageDescriptor>,
    graph: Option<GraphBlueprint>,
}

impl Plan {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, PlanError> {
        if stages.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage {
                    name: stage.name.clone(),
                });
            }
        }
        Ok(Self {
            stages,
            graph: None,
        })
    }

    pub fn with_graph(mut self, graph: GraphBlueprint) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn workflow_steps(&self) -> Vec<WorkflowStep> {
        self.stages
            .iter()
            .map(|s| WorkflowStep::pending(&s.name, s.requires_selection, &s.notes))
            .collect()
    }

    /// The attached graph, or a linear layout of this plan.
    pub fn graph(&self) -> GraphBlueprint {
        self.graph.clone().unwrap_or_else(|| {
            GraphBlueprint::linear(
                self.stages
                    .iter()
                    .map(|s| (s.name.as_str(), s.requires_selection)),
            )
        })
    }
}

/// Produces the plan for a run, once, before its first stage.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Plan, PlanError>;
}

#[async_trait]
impl PlanSource for Plan {
    async fn resolve(&self, _query: &str) -> Result<Plan, PlanError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DecomposeReply {
    #[serde(default)]
    workflow_plan: Vec<String>,
}

/// Chooses a plan from, in order: the workflow override, the decompose
/// stage (when it has live settings), or the default pipeline.
#[derive(Clone)]
pub struct Planner {
    catalog: StageCatalog,
    workflow: WorkflowStore,
}

impl Planner {
    pub fn new(catalog: StageCatalog, workflow: WorkflowStore) -> Self {
        Self { catalog, workflow }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    async fn choose_kinds(&self, query: &str) -> Vec<StageKind> {
        if let Some(kinds) = self.workflow.plan_override() {
            tracing::debug!(?kinds, "Using workflow override");
            return kinds;
        }

        let client = self.catalog.client_for(StageKind::Decompose);
        if client.is_demo() {
            return StageKind::PIPELINE.to_vec();
        }

        let available: Vec<&str> = StageKind::PIPELINE.iter().map(|k| k.as_str()).collect();
        let system = self
            .catalog
            .settings()
            .get(StageKind::Decompose.as_str())
            .and_then(|s| s.prompt)
            .unwrap_or_else(|| StageKind::Decompose.default_prompt().to_string());
        match client.complete(&system, &prompts::decompose(query, &available)).await {
            Ok(raw) => match UpstreamReply::<DecomposeReply>::parse(&raw).structured() {
                Some(reply) => kinds_from_proposal(&reply.workflow_plan),
                None => {
                    tracing::warn!("Decomposer reply was not a plan; using default plan");
                    StageKind::PIPELINE.to_vec()
                }
            },
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::warn!(%error, "Decomposer failed; using default plan");
                StageKind::PIPELINE.to_vec()
            }
        }
    }

    fn build(&self, kinds: &[StageKind]) -> Result<Plan, PlanError> {
        let stages = kinds
            .iter()
            .map(|kind| self.catalog.descriptor(*kind))
            .collect::<Result<Vec<_>, _>>()?;
        let plan = Plan::new(stages)?;
        Ok(match self.workflow.custom_graph() {
            Some(graph) => plan.with_graph(graph),
            None => plan,
        })
    }
}

/// Turn a proposed stage list into a runnable one: unknown, non-pipeline and
/// repeated names are dropped, and `intake` is moved to the front.
pub fn kinds_from_proposal(proposal: &[String]) -> Vec<StageKind> {
    let mut kinds = vec![StageKind::Intake];
    for name in proposal {
        match name.parse::<StageKind>() {
            Ok(kind) if kind.is_pipeline_stage() && !kinds.contains(&kind) => kinds.push(kind),
            Ok(_) => {}
            Err(_) => tracing::debug!(stage = %name, "Dropping unknown stage from proposal"),
        }
    }
    if kinds.len() == 1 {
        return StageKind::PIPELINE.to_vec();
    }
    kinds
}

#[async_trait]
impl PlanSource for Planner {
    async fn resolve(&self, query: &str) -> Result<Plan, PlanError> {
        let mut kinds = self.choose_kinds(query).await;
        if kinds.first() != Some(&StageKind::Intake) {
            kinds.retain(|k| *k != StageKind::Intake);
            kinds.insert(0, StageKind::Intake);
        }
        match self.build(&kinds) {
            Ok(plan) => Ok(plan),
            Err(e) => {
                tracing::warn!(error = %e, "Chosen plan is invalid; using default plan");
                self.build(&StageKind::PIPELINE)
            }
        }
    }
}
