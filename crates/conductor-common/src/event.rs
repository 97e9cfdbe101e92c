//! Run events as published on the event bus.
//!
//! On the wire an event is a flat JSON object:
//!
//! ```json
//! {"seq": 3, "ts": "2026-01-01T00:00:00Z", "kind": "enter", "payload": {"node": "research"}}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{GraphBlueprint, WorkflowStep};
use crate::records::{StageInput, StageRecord};
use crate::run::{RunMode, Selection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Workflow,
    Enter,
    Segment,
    Options,
    AwaitingSelection,
    Selection,
    Exit,
    Paused,
    Resumed,
    Stopping,
    Done,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Enter => "enter",
            Self::Segment => "segment",
            Self::Options => "options",
            Self::AwaitingSelection => "awaiting_selection",
            Self::Selection => "selection",
            Self::Exit => "exit",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Stopping => "stopping",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    /// The resolved plan, published once before the first stage runs.
    Workflow {
        mode: RunMode,
        steps: Vec<WorkflowStep>,
        graph: GraphBlueprint,
    },
    Enter {
        node: String,
    },
    Segment {
        node: String,
        input: StageInput,
        output: StageRecord,
    },
    Options {
        node: String,
        options: Vec<String>,
    },
    AwaitingSelection {
        node: String,
        options: Vec<String>,
    },
    Selection {
        node: String,
        choice_index: Option<usize>,
        chosen: String,
        rationale: String,
        automatic: bool,
    },
    Exit {
        node: String,
    },
    Paused {
        #[serde(default)]
        node: Option<String>,
    },
    Resumed {
        #[serde(default)]
        node: Option<String>,
    },
    Stopping {
        #[serde(default)]
        node: Option<String>,
    },
    Done {
        #[serde(default)]
        final_text: Option<String>,
        #[serde(default)]
        stopped: bool,
    },
    /// A stage failure (with `node`) or a controller fault (without).
    Error {
        #[serde(default)]
        node: Option<String>,
        message: String,
    },
}

impl EventBody {
    pub fn selection(node: &str, selection: &Selection) -> Self {
        Self::Selection {
            node: node.to_string(),
            choice_index: selection.index,
            chosen: selection.chosen.clone(),
            rationale: selection.rationale.clone(),
            automatic: selection.automatic,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Workflow { .. } => EventKind::Workflow,
            Self::Enter { .. } => EventKind::Enter,
            Self::Segment { .. } => EventKind::Segment,
            Self::Options { .. } => EventKind::Options,
            Self::AwaitingSelection { .. } => EventKind::AwaitingSelection,
            Self::Selection { .. } => EventKind::Selection,
            Self::Exit { .. } => EventKind::Exit,
            Self::Paused { .. } => EventKind::Paused,
            Self::Resumed { .. } => EventKind::Resumed,
            Self::Stopping { .. } => EventKind::Stopping,
            Self::Done { .. } => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The stage this event refers to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Enter { node }
            | Self::Segment { node, .. }
            | Self::Options { node, .. }
            | Self::AwaitingSelection { node, .. }
            | Self::Selection { node, .. }
            | Self::Exit { node } => Some(node),
            Self::Paused { node }
            | Self::Resumed { node }
            | Self::Stopping { node }
            | Self::Error { node, .. } => node.as_deref(),
            Self::Workflow { .. } | Self::Done { .. } => None,
        }
    }
}

/// One entry of a run's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Gapless per-run sequence number starting at 0.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn node(&self) -> Option<&str> {
        self.body.node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat_with_kind_and_payload() {
        let event = RunEvent {
            seq: 4,
            ts: Utc::now(),
            body: EventBody::Enter {
                node: "research".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 4);
        assert_eq!(json["kind"], "enter");
        assert_eq!(json["payload"]["node"], "research");
    }

    #[test]
    fn error_event_without_node_is_a_controller_fault() {
        let body = EventBody::Error {
            node: None,
            message: "boom".into(),
        };
        assert_eq!(body.kind(), EventKind::Error);
        assert_eq!(body.node(), None);
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""kind":"error""#));
        assert!(json.contains(r#""message":"boom""#));
    }

    #[test]
    fn selection_event_copies_gate_result() {
        let selection = Selection {
            index: Some(1),
            chosen: "b".into(),
            rationale: "Operator picked option [1].".into(),
            automatic: false,
        };
        let body = EventBody::selection("analysis", &selection);
        match body {
            EventBody::Selection {
                node,
                choice_index,
                chosen,
                automatic,
                ..
            } => {
                assert_eq!(node, "analysis");
                assert_eq!(choice_index, Some(1));
                assert_eq!(chosen, "b");
                assert!(!automatic);
            }
            other => panic!("Expected Selection, got {:?}", other),
        }
    }

    #[test]
    fn kind_names_match_wire_names() {
        let json = serde_json::to_string(&EventKind::AwaitingSelection).unwrap();
        assert_eq!(json, format!("\"{}\"", EventKind::AwaitingSelection.as_str()));
    }
}
