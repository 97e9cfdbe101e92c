//! Typed stage input and output records.

use serde::{Deserialize, Serialize};

use crate::run::{RunMode, Selection};

/// Accumulated run context handed to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    /// The user query, replaced by the normalized query once intake has run.
    pub query: String,
    pub mode: RunMode,
    /// Text handed forward by the previous stage: the selected candidate when
    /// a selection was made, otherwise the stage's primary output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl StageInput {
    pub fn new(query: impl Into<String>, mode: RunMode) -> Self {
        Self {
            query: query.into(),
            mode,
            carry: None,
            validation: None,
        }
    }

    /// The text a stage should work on: the carried text, or the query when
    /// nothing has been carried yet.
    pub fn subject(&self) -> &str {
        self.carry.as_deref().unwrap_or(&self.query)
    }

    /// Fold a finished stage's output (and its selection, if any) into the context.
    pub fn advance(&mut self, record: &StageRecord, selection: Option<&Selection>) {
        match record {
            StageRecord::Intake(intake) => self.query = intake.normalized_query.clone(),
            StageRecord::Validation(report) => self.validation = Some(report.clone()),
            _ => {}
        }

        match selection.filter(|s| s.index.is_some()) {
            Some(selection) => self.carry = Some(selection.chosen.clone()),
            None => {
                if let Some(text) = record.carry() {
                    self.carry = Some(text.to_string());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub normalized_query: String,
    pub engagement_mode: RunMode,
    pub tools_needed: Vec<String>,
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub options: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_consistent: bool,
    /// Always within `[0.0, 1.0]`.
    pub confidence: f64,
    pub notes: String,
}

impl ValidationReport {
    pub fn new(is_consistent: bool, confidence: f64, notes: impl Into<String>) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            is_consistent,
            confidence,
            notes: notes.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub final_text: String,
}

/// Single-field record for free-form stage output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub text: String,
}

/// Output of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageRecord {
    Intake(IntakeRecord),
    Research(ResearchRecord),
    Analysis(AnalysisRecord),
    Validation(ValidationReport),
    Output(OutputRecord),
    Text(TextRecord),
}

impl StageRecord {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextRecord { text: text.into() })
    }

    pub fn candidates(candidates: Vec<String>) -> Self {
        Self::Research(ResearchRecord { candidates })
    }

    /// Candidate outputs the selection gate chooses between.
    pub fn options(&self) -> &[String] {
        match self {
            Self::Research(research) => &research.candidates,
            Self::Analysis(analysis) => &analysis.options,
            _ => &[],
        }
    }

    /// Primary text this record hands to the next stage when no selection is made.
    pub fn carry(&self) -> Option<&str> {
        match self {
            Self::Intake(intake) => Some(&intake.normalized_query),
            Self::Output(output) => Some(&output.final_text),
            Self::Text(text) => Some(&text.text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(index: Option<usize>, chosen: &str) -> Selection {
        Selection {
            index,
            chosen: chosen.to_string(),
            rationale: String::new(),
            automatic: true,
        }
    }

    #[test]
    fn stage_record_is_tagged_by_type() {
        let record = StageRecord::candidates(vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "research");
        assert_eq!(json["candidates"][1], "b");
    }

    #[test]
    fn intake_replaces_query_and_carry() {
        let mut input = StageInput::new("  What is Rust? ", RunMode::Autonomous);
        let intake = StageRecord::Intake(IntakeRecord {
            normalized_query: "What is Rust?".into(),
            engagement_mode: RunMode::Autonomous,
            tools_needed: vec![],
            constraints: vec![],
        });
        input.advance(&intake, None);
        assert_eq!(input.query, "What is Rust?");
        assert_eq!(input.subject(), "What is Rust?");
    }

    #[test]
    fn selection_wins_over_record_carry() {
        let mut input = StageInput::new("q", RunMode::Interactive);
        let record = StageRecord::candidates(vec!["first".into(), "second".into()]);
        input.advance(&record, Some(&selection(Some(1), "second")));
        assert_eq!(input.carry.as_deref(), Some("second"));
    }

    #[test]
    fn empty_selection_keeps_previous_carry() {
        let mut input = StageInput::new("q", RunMode::Autonomous);
        input.carry = Some("kept".into());
        let record = StageRecord::candidates(vec![]);
        input.advance(&record, Some(&selection(None, "")));
        assert_eq!(input.carry.as_deref(), Some("kept"));
    }

    #[test]
    fn validation_is_remembered_without_touching_carry() {
        let mut input = StageInput::new("q", RunMode::Autonomous);
        input.carry = Some("draft".into());
        let report = ValidationReport::new(true, 0.9, "fine");
        input.advance(&StageRecord::Validation(report.clone()), None);
        assert_eq!(input.validation, Some(report));
        assert_eq!(input.carry.as_deref(), Some("draft"));
    }

    #[test]
    fn validation_confidence_is_clamped() {
        assert_eq!(ValidationReport::new(true, 3.0, "").confidence, 1.0);
        assert_eq!(ValidationReport::new(true, -1.0, "").confidence, 0.0);
        assert_eq!(ValidationReport::new(true, f64::NAN, "").confidence, 0.0);
    }
}
