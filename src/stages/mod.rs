//! Pipeline stages.
//!
//! A stage is a function from the accumulated run context to a typed record.
//! The controller only sees the [`Stage`] trait; the built-in agent stages
//! are assembled by [`StageCatalog`] from the current stage settings.

pub mod agents;
pub mod llm;
pub mod prompts;
pub mod search;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use conductor_common::{StageInput, StageRecord};

use crate::config::{SearchSection, SettingsStore};
use crate::errors::{PlanError, StageFailure};
use crate::plan::StageDescriptor;

use self::llm::{CompletionClient, completion_client};
use self::search::{SearchClient, search_client};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// A single pipeline step.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn invoke(&self, input: &StageInput) -> Result<StageRecord, StageFailure>;
}

/// The closed set of built-in stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Intake,
    /// Planning helper; proposes a plan but never runs inside one.
    Decompose,
    Research,
    Analysis,
    Validation,
    Output,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Intake,
        StageKind::Decompose,
        StageKind::Research,
        StageKind::Analysis,
        StageKind::Validation,
        StageKind::Output,
    ];

    /// The default plan, in order.
    pub const PIPELINE: [StageKind; 5] = [
        StageKind::Intake,
        StageKind::Research,
        StageKind::Analysis,
        StageKind::Validation,
        StageKind::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Intake => "intake",
            StageKind::Decompose => "decompose",
            StageKind::Research => "research",
            StageKind::Analysis => "analysis",
            StageKind::Validation => "validation",
            StageKind::Output => "output",
        }
    }

    pub fn requires_selection(&self) -> bool {
        matches!(self, StageKind::Research | StageKind::Analysis)
    }

    pub fn is_pipeline_stage(&self) -> bool {
        *self != StageKind::Decompose
    }

    pub fn default_prompt(&self) -> &'static str {
        match self {
            StageKind::Intake => prompts::INTAKE_PROMPT,
            StageKind::Decompose => prompts::DECOMPOSE_PROMPT,
            StageKind::Research => prompts::RESEARCH_PROMPT,
            StageKind::Analysis => prompts::ANALYSIS_PROMPT,
            StageKind::Validation => prompts::VALIDATION_PROMPT,
            StageKind::Output => prompts::OUTPUT_PROMPT,
        }
    }

    /// Timeline note shown next to the stage in the `workflow` event.
    pub fn notes(&self) -> &'static str {
        match self {
            StageKind::Intake => "Normalize the query and infer constraints",
            StageKind::Decompose => "Propose the stage sequence",
            StageKind::Research => "Search and summarize candidate answers",
            StageKind::Analysis => "Compare candidates into answer options",
            StageKind::Validation => "Check consistency and confidence",
            StageKind::Output => "Compose the final answer",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        // Accept the "ResearchAgent" spelling used by older dashboards.
        let normalized = normalized.strip_suffix("agent").unwrap_or(&normalized);
        match normalized {
            "intake" | "input" => Ok(StageKind::Intake),
            "decompose" | "taskdecomposer" => Ok(StageKind::Decompose),
            "research" => Ok(StageKind::Research),
            "analysis" => Ok(StageKind::Analysis),
            "validation" => Ok(StageKind::Validation),
            "output" => Ok(StageKind::Output),
            _ => Err(PlanError::UnknownStage {
                name: s.to_string(),
            }),
        }
    }
}

/// Builds the built-in stages from the live settings store.
#[derive(Clone)]
pub struct StageCatalog {
    settings: SettingsStore,
    search: Arc<dyn SearchClient>,
    http: reqwest::Client,
}

impl StageCatalog {
    pub fn new(settings: SettingsStore, search: &SearchSection) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let search = search_client(search, &http);
        Ok(Self {
            settings,
            search,
            http,
        })
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn client_for(&self, kind: StageKind) -> Arc<dyn CompletionClient> {
        let settings = self.settings.get(kind.as_str()).unwrap_or_default();
        completion_client(&settings, &self.http)
    }

    /// Whether any pipeline stage talks to a real completion endpoint.
    pub fn has_live_stage(&self) -> bool {
        StageKind::PIPELINE.iter().any(|kind| {
            self.settings
                .get(kind.as_str())
                .is_some_and(|settings| settings.is_live())
        })
    }

    fn prompt_for(&self, kind: StageKind) -> String {
        self.settings
            .get(kind.as_str())
            .and_then(|settings| settings.prompt)
            .unwrap_or_else(|| kind.default_prompt().to_string())
    }

    pub fn build(&self, kind: StageKind) -> Result<Arc<dyn Stage>, PlanError> {
        let client = self.client_for(kind);
        let prompt = self.prompt_for(kind);
        let stage: Arc<dyn Stage> = match kind {
            StageKind::Intake => Arc::new(agents::IntakeStage { client, prompt }),
            StageKind::Research => Arc::new(agents::ResearchStage {
                client,
                search: self.search.clone(),
                prompt,
            }),
            StageKind::Analysis => Arc::new(agents::AnalysisStage { client, prompt }),
            StageKind::Validation => Arc::new(agents::ValidationStage { client, prompt }),
            StageKind::Output => Arc::new(agents::OutputStage { client, prompt }),
            StageKind::Decompose => {
                return Err(PlanError::UnknownStage {
                    name: kind.as_str().to_string(),
                });
            }
        };
        Ok(stage)
    }

    pub fn descriptor(&self, kind: StageKind) -> Result<StageDescriptor, PlanError> {
        Ok(StageDescriptor {
            name: kind.as_str().to_string(),
            handler: self.build(kind)?,
            requires_selection: kind.requires_selection(),
            notes: kind.notes().to_string(),
        })
    }
}
