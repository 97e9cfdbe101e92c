use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::records::{StageInput, StageRecord};

/// Opaque identifier of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Engagement mode of a run.
///
/// `Autonomous` resolves every selection to the first candidate.
/// `Interactive` suspends at stages that require a selection until an
/// operator submits one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    #[serde(alias = "auto", alias = "agents_only")]
    Autonomous,
    #[serde(alias = "human", alias = "engage_human")]
    Interactive,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Interactive => "interactive",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "autonomous" | "auto" | "agents_only" => Ok(Self::Autonomous),
            "interactive" | "human" | "engage_human" => Ok(Self::Interactive),
            _ => Err(format!(
                "Invalid run mode '{}'. Valid values: autonomous, interactive",
                s
            )),
        }
    }
}

/// Lifecycle status of a run.
///
/// | From                 | To                                                    |
/// |----------------------|-------------------------------------------------------|
/// | `Running`            | `Paused`, `AwaitingSelection`, `PausedError`, `Stopping`, `Done`, `Error` |
/// | `Paused`             | `Running`, `Stopping`, `Error`                        |
/// | `AwaitingSelection`  | `Running`, `Stopping`, `Error`                        |
/// | `PausedError`        | `Stopping`, `Error`                                   |
/// | `Stopping`           | `Done`, `Error`                                       |
/// | `Done`, `Error`      | terminal                                              |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Paused,
    PausedError,
    AwaitingSelection,
    Stopping,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::PausedError => "paused_error",
            Self::AwaitingSelection => "awaiting_selection",
            Self::Stopping => "stopping",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether `next` is a legal single step from `self`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Running, Paused | AwaitingSelection | PausedError | Stopping | Done | Error) => true,
            (Paused, Running | Stopping | Error) => true,
            (AwaitingSelection, Running | Stopping | Error) => true,
            (PausedError, Stopping | Error) => true,
            (Stopping, Done | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "paused_error" => Ok(Self::PausedError),
            "awaiting_selection" => Ok(Self::AwaitingSelection),
            "stopping" => Ok(Self::Stopping),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// An operator's choice for one stage, waiting to be consumed by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub stage: String,
    pub choice_index: i64,
    pub submitted_at: DateTime<Utc>,
}

/// Result of the selection gate for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Index into the candidate list, `None` when there were no candidates.
    pub index: Option<usize>,
    pub chosen: String,
    pub rationale: String,
    pub automatic: bool,
}

/// Last recorded input/output of a stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub input: StageInput,
    pub output: StageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// The stage failure that parked a run in `paused_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailureInfo {
    pub node: String,
    pub message: String,
}

/// Point-in-time view of a run. Readers must tolerate staleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub mode: RunMode,
    pub query: String,
    pub status: RunStatus,
    pub paused: bool,
    pub stop_requested: bool,
    /// Ordered stage names, empty until the plan is resolved.
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub store: BTreeMap<String, StageEntry>,
    pub pending_selections: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailureInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn new(id: RunId, mode: RunMode, query: impl Into<String>) -> Self {
        Self {
            id,
            mode,
            query: query.into(),
            status: RunStatus::Running,
            paused: false,
            stop_requested: false,
            plan: Vec::new(),
            current_stage: None,
            store: BTreeMap::new(),
            pending_selections: BTreeMap::new(),
            final_text: None,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}
