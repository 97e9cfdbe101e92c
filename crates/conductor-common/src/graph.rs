//! Visualization metadata published with the `workflow` event.

use serde::{Deserialize, Serialize};

/// Horizontal spacing of the default linear layout.
const LAYOUT_STEP_X: f64 = 220.0;
const LAYOUT_ORIGIN: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub requires_selection: bool,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default, rename = "type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphBlueprint {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphBlueprint {
    /// Lay out `stages` left to right, chaining each to the next.
    ///
    /// Each item is `(stage name, requires selection)`.
    pub fn linear<'a>(stages: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let mut nodes: Vec<GraphNode> = Vec::new();
        for (order, (name, requires_selection)) in stages.into_iter().enumerate() {
            nodes.push(GraphNode {
                id: name.to_string(),
                label: Some(capitalize(name)),
                requires_selection,
                order: Some(order as u32),
                node_type: Some(if requires_selection { "tool" } else { "stem" }.to_string()),
                x: Some(LAYOUT_ORIGIN + LAYOUT_STEP_X * order as f64),
                y: Some(LAYOUT_ORIGIN),
            });
        }
        let edges = nodes
            .windows(2)
            .map(|pair| GraphEdge {
                source: pair[0].id.clone(),
                target: pair[1].id.clone(),
                label: None,
            })
            .collect();
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One row of the plan timeline shown to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub stage: String,
    pub requires_selection: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default = "default_step_status")]
    pub status: String,
}

fn default_step_status() -> String {
    "pending".to_string()
}

impl WorkflowStep {
    pub fn pending(stage: impl Into<String>, requires_selection: bool, notes: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            requires_selection,
            notes: notes.into(),
            status: default_step_status(),
        }
    }
}
