use conductor_common::{StageInput, ValidationReport};

pub const INTAKE_PROMPT: &str =
    "You are the intake stage. Normalize the user query, infer the engagement mode and list guardrails.";
pub const DECOMPOSE_PROMPT: &str =
    "You are the task decomposer. Break the normalized query into a short ordered list of stages.";
pub const RESEARCH_PROMPT: &str =
    "You are the research stage. Gather multiple perspectives from the supplied snippets and summarize each candidate.";
pub const ANALYSIS_PROMPT: &str =
    "You are the analysis stage. Compare the research candidates and produce reasoned answer options.";
pub const VALIDATION_PROMPT: &str =
    "You are the validation stage. Fact-check the preferred answer, track confidence and highlight gaps.";
pub const OUTPUT_PROMPT: &str =
    "You are the output stage. Compose the final response with validation notes.";

pub fn intake(input: &StageInput) -> String {
    format!(
        r#"Respond as JSON with keys normalized_query, engagement_mode ("autonomous" or "interactive"), tools_needed (list), constraints (list).

User query: {}
Preferred mode: {}"#,
        input.query, input.mode
    )
}

pub fn decompose(query: &str, available: &[&str]) -> String {
    format!(
        r#"Return JSON {{"workflow_plan": ["research", ...]}} using only these stage names: {}.

Query: {}"#,
        available.join(", "),
        query
    )
}

pub fn research(query: &str, snippets: &[String]) -> String {
    format!(
        r#"Synthesize up to three candidate answers from the search snippets. Respond JSON {{"candidates": [..]}}.

Query: {}
Snippets:
{}"#,
        query,
        bullet_list(snippets)
    )
}

pub fn analysis(subject: &str) -> String {
    format!(
        r#"Compare the supplied material and output JSON {{"options": [..], "rationale": "..."}}.

Material: {}"#,
        subject
    )
}

pub fn validation(draft: &str) -> String {
    format!(
        r#"Validate the draft answer. Return JSON {{"is_consistent": bool, "confidence": 0-1, "notes": "..."}}.

Draft: {}"#,
        draft
    )
}

pub fn output(option: &str, validation: Option<&ValidationReport>) -> String {
    let validation = match validation {
        Some(report) => format!(
            "consistent={}, confidence={:.2}, notes={}",
            report.is_consistent, report.confidence, report.notes
        ),
        None => "none".to_string(),
    };
    format!(
        r#"Compose the final answer referencing the validation notes. Return JSON {{"final_text": string}}.

Selected option: {}
Validation: {}"#,
        option, validation
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
