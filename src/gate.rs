//! Selection gate: decides whether a stage's candidates are resolved
//! automatically or must wait for an operator's choice.

use conductor_common::{RunMode, Selection};

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Resolved without outside input.
    Resolved(Selection),
    /// The controller must publish `awaiting_selection` and wait for a record.
    AwaitOperator,
}

/// Decide how a stage's candidates get resolved.
///
/// Only an interactive run at a stage that requires selection, with at least
/// one candidate, ever waits. An empty candidate list resolves to an empty,
/// automatic selection regardless of mode.
pub fn decide(options: &[String], mode: RunMode, requires_selection: bool) -> GateDecision {
    if options.is_empty() {
        return GateDecision::Resolved(empty_selection());
    }
    if mode == RunMode::Interactive && requires_selection {
        return GateDecision::AwaitOperator;
    }
    let rationale = match mode {
        RunMode::Autonomous => "Autonomous mode selected the first option.",
        RunMode::Interactive => "Stage does not require a selection; using the first option.",
    };
    GateDecision::Resolved(Selection {
        index: Some(0),
        chosen: options[0].clone(),
        rationale: rationale.to_string(),
        automatic: true,
    })
}

/// Apply an operator's choice. Negative or out-of-range indices fall back to
/// the first candidate.
pub fn resolve(options: &[String], choice_index: i64) -> Selection {
    if options.is_empty() {
        return empty_selection();
    }
    let picked = usize::try_from(choice_index)
        .ok()
        .and_then(|i| options.get(i).map(|chosen| (i, chosen)));
    match picked {
        Some((index, chosen)) => Selection {
            index: Some(index),
            chosen: chosen.clone(),
            rationale: format!("Operator picked option [{}].", index),
            automatic: false,
        },
        None => Selection {
            index: Some(0),
            chosen: options[0].clone(),
            rationale: format!(
                "Operator choice [{}] is out of range; using option [0].",
                choice_index
            ),
            automatic: false,
        },
    }
}

fn empty_selection() -> Selection {
    Selection {
        index: None,
        chosen: String::new(),
        rationale: "No candidates to choose from.".to_string(),
        automatic: true,
    }
}
