//! Shared domain types for the conductor run controller.
//!
//! These types cross the boundary between the controller, the HTTP layer and
//! any observer decoding the event stream, so they carry no runtime
//! dependencies beyond serde.

pub mod event;
pub mod graph;
pub mod records;
pub mod run;

pub use event::{EventBody, EventKind, RunEvent};
pub use graph::{GraphBlueprint, GraphEdge, GraphNode, WorkflowStep};
pub use records::{
    AnalysisRecord, IntakeRecord, OutputRecord, ResearchRecord, StageInput, StageRecord,
    TextRecord, ValidationReport,
};
pub use run::{
    RunId, RunMode, RunSnapshot, RunStatus, Selection, SelectionRecord, StageEntry,
    StageFailureInfo,
};
